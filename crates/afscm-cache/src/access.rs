//! Per-entry rights cache.
//!
//! Holds a fixed number of (principal, rights) pairs. When all slots are
//! taken a random one is overwritten.

use afscm_rpc::AccessRights;
use rand::Rng;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessMap {
    slots: Vec<Option<(u64, AccessRights)>>,
}

impl AccessMap {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity.max(1)],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, principal: u64) -> Option<AccessRights> {
        self.slots
            .iter()
            .flatten()
            .find(|(p, _)| *p == principal)
            .map(|(_, rights)| *rights)
    }

    pub fn set(&mut self, principal: u64, rights: AccessRights) {
        let idx = self
            .slots
            .iter()
            .position(|s| matches!(s, Some((p, _)) if *p == principal))
            .or_else(|| self.slots.iter().position(Option::is_none))
            .unwrap_or_else(|| rand::thread_rng().gen_range(0..self.slots.len()));
        self.slots[idx] = Some((principal, rights));
    }

    pub fn remove(&mut self, principal: u64) -> bool {
        let mut removed = false;
        for slot in self.slots.iter_mut() {
            if matches!(slot, Some((p, _)) if *p == principal) {
                *slot = None;
                removed = true;
            }
        }
        removed
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
