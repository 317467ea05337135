//! One-way notices to the kernel side.

use afscm_rpc::FileId;
use tokio::sync::mpsc;
use tracing::warn;

/// Told when an entry the kernel holds is no longer valid.
pub trait KernelNotifier: Send + Sync {
    fn invalidate(&self, fid: FileId);
}

/// Drops every notice. For caches with no kernel attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl KernelNotifier for NullNotifier {
    fn invalidate(&self, _fid: FileId) {}
}

/// Forwards notices over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<FileId>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FileId>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl KernelNotifier for ChannelNotifier {
    fn invalidate(&self, fid: FileId) {
        if self.tx.send(fid).is_err() {
            warn!("kernel notice for {} dropped, receiver gone", fid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_delivers_in_order() {
        let (notifier, mut rx) = ChannelNotifier::new();
        notifier.invalidate(FileId::new(1, 2, 3, 4));
        notifier.invalidate(FileId::new(1, 2, 5, 6));
        assert_eq!(rx.recv().await, Some(FileId::new(1, 2, 3, 4)));
        assert_eq!(rx.recv().await, Some(FileId::new(1, 2, 5, 6)));
    }

    #[test]
    fn test_closed_channel_does_not_panic() {
        let (notifier, rx) = ChannelNotifier::new();
        drop(rx);
        notifier.invalidate(FileId::new(1, 1, 1, 1));
    }
}
