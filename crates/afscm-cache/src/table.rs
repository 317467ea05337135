//! Entry arena with a hash index and an intrusive LRU list.
//!
//! Every slot sits on the LRU list exactly once. The head is the most
//! recently used end; free slots are pushed to the tail so allocation finds
//! them first. A slot is in the index iff its entry is in use.

use crate::entry::{CacheEntry, SlotId};
use afscm_rpc::FileId;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Default)]
struct Link {
    prev: Option<SlotId>,
    next: Option<SlotId>,
}

pub(crate) struct SlotTable {
    entries: Vec<CacheEntry>,
    links: Vec<Link>,
    head: Option<SlotId>,
    tail: Option<SlotId>,
    index: HashMap<FileId, SlotId>,
    access_slots: usize,
}

impl SlotTable {
    pub(crate) fn new(nodes: usize, access_slots: usize) -> Self {
        let mut table = Self {
            entries: Vec::with_capacity(nodes),
            links: Vec::with_capacity(nodes),
            head: None,
            tail: None,
            index: HashMap::with_capacity(nodes),
            access_slots,
        };
        table.grow(nodes);
        table
    }

    /// Appends free slots at the cold end.
    pub(crate) fn grow(&mut self, n: usize) {
        let start = self.entries.len();
        for idx in start..start + n {
            let slot = SlotId(idx as u16);
            self.entries.push(CacheEntry::new(slot, self.access_slots));
            self.links.push(Link::default());
            self.push_tail(slot);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn hashed(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn get(&self, slot: SlotId) -> &CacheEntry {
        &self.entries[slot.index()]
    }

    pub(crate) fn get_mut(&mut self, slot: SlotId) -> &mut CacheEntry {
        &mut self.entries[slot.index()]
    }

    pub(crate) fn lookup(&self, fid: &FileId) -> Option<SlotId> {
        self.index.get(fid).copied()
    }

    pub(crate) fn hash(&mut self, fid: FileId, slot: SlotId) {
        debug_assert!(!self.index.contains_key(&fid), "{} hashed twice", fid);
        self.index.insert(fid, slot);
    }

    pub(crate) fn unhash(&mut self, fid: &FileId) -> Option<SlotId> {
        self.index.remove(fid)
    }

    pub(crate) fn in_use(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.iter().filter(|e| e.flags.in_use)
    }

    pub(crate) fn coldest(&self) -> Option<SlotId> {
        self.tail
    }

    /// Neighbour one step towards the hot end.
    pub(crate) fn hotter(&self, slot: SlotId) -> Option<SlotId> {
        self.links[slot.index()].prev
    }

    /// Slots from the cold end towards the hot end.
    pub(crate) fn cold_to_hot(&self) -> Vec<SlotId> {
        let mut out = Vec::with_capacity(self.entries.len());
        let mut cur = self.tail;
        while let Some(slot) = cur {
            out.push(slot);
            cur = self.links[slot.index()].prev;
        }
        out
    }

    /// Moves a slot to the hot end.
    pub(crate) fn touch(&mut self, slot: SlotId) {
        if self.head == Some(slot) {
            return;
        }
        self.unlink(slot);
        self.push_head(slot);
    }

    /// Moves a slot to the cold end.
    pub(crate) fn demote(&mut self, slot: SlotId) {
        if self.tail == Some(slot) {
            return;
        }
        self.unlink(slot);
        self.push_tail(slot);
    }

    fn unlink(&mut self, slot: SlotId) {
        let Link { prev, next } = self.links[slot.index()];
        match prev {
            Some(p) => self.links[p.index()].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.links[n.index()].prev = prev,
            None => self.tail = prev,
        }
        self.links[slot.index()] = Link::default();
    }

    fn push_head(&mut self, slot: SlotId) {
        self.links[slot.index()] = Link {
            prev: None,
            next: self.head,
        };
        match self.head {
            Some(h) => self.links[h.index()].prev = Some(slot),
            None => self.tail = Some(slot),
        }
        self.head = Some(slot);
    }

    fn push_tail(&mut self, slot: SlotId) {
        self.links[slot.index()] = Link {
            prev: self.tail,
            next: None,
        };
        match self.tail {
            Some(t) => self.links[t.index()].next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
    }

    /// Checks list linkage and index membership; returns a description of
    /// the first problem found.
    pub(crate) fn check(&self) -> Result<(), String> {
        let order = self.cold_to_hot();
        if order.len() != self.entries.len() {
            return Err(format!(
                "lru holds {} of {} slots",
                order.len(),
                self.entries.len()
            ));
        }
        for entry in &self.entries {
            let hashed = self.index.get(&entry.fid) == Some(&entry.slot);
            if entry.flags.in_use != hashed {
                return Err(format!(
                    "slot {} in_use={} hashed={}",
                    entry.slot, entry.flags.in_use, hashed
                ));
            }
        }
        if self.index.len() != self.in_use().count() {
            return Err("index holds slots that are not in use".to_string());
        }
        Ok(())
    }
}
