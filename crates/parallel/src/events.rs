//! Transfer lifecycle events.
//!
//! Events are published on a broadcast channel. Slow subscribers lag and drop
//! events rather than stalling the transfer.

use std::path::PathBuf;

use tokio::sync::broadcast;

/// Which side of a transfer produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgress {
    pub transfer_id: String,
    pub direction: Direction,
    pub bytes_done: u64,
    pub total_bytes: u64,
    pub chunks_done: u32,
    pub total_chunks: u32,
    pub bytes_per_second: f64,
}

impl TransferProgress {
    /// Completion ratio in `0.0..=1.0`; an empty file counts as done.
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        self.bytes_done as f64 / self.total_bytes as f64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Initiated {
        transfer_id: String,
        direction: Direction,
        file_name: String,
        file_size: u64,
        total_chunks: u32,
        /// Upload lanes; zero on the receiving side.
        connections: u32,
    },
    AwaitingApproval {
        transfer_id: String,
        request_id: String,
    },
    Progress(TransferProgress),
    ChunkRetry {
        transfer_id: String,
        chunk_index: u32,
        attempt: u32,
        error: String,
    },
    Completed {
        transfer_id: String,
        direction: Direction,
        path: Option<PathBuf>,
        file_hash: String,
    },
    Failed {
        transfer_id: String,
        direction: Direction,
        error: String,
    },
    Cancelled {
        transfer_id: String,
        direction: Direction,
    },
}

impl TransferEvent {
    pub fn transfer_id(&self) -> &str {
        match self {
            Self::Initiated { transfer_id, .. }
            | Self::AwaitingApproval { transfer_id, .. }
            | Self::ChunkRetry { transfer_id, .. }
            | Self::Completed { transfer_id, .. }
            | Self::Failed { transfer_id, .. }
            | Self::Cancelled { transfer_id, .. } => transfer_id,
            Self::Progress(p) => &p.transfer_id,
        }
    }

    /// True for the last event a transfer emits.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Cancelled { .. }
        )
    }
}

/// Fan-out of [`TransferEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TransferEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.tx.subscribe()
    }

    /// Publishes `event`; a bus with no subscribers drops it.
    pub fn emit(&self, event: TransferEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(TransferEvent::Cancelled {
            transfer_id: "t1".into(),
            direction: Direction::Send,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.transfer_id(), "t1");
        assert!(event.is_terminal());
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.emit(TransferEvent::AwaitingApproval {
            transfer_id: "t1".into(),
            request_id: "r1".into(),
        });
    }

    #[test]
    fn progress_fraction() {
        let mut progress = TransferProgress {
            transfer_id: "t1".into(),
            direction: Direction::Receive,
            bytes_done: 25,
            total_bytes: 100,
            chunks_done: 1,
            total_chunks: 4,
            bytes_per_second: 0.0,
        };
        assert!((progress.fraction() - 0.25).abs() < f64::EPSILON);
        assert!(!TransferEvent::Progress(progress.clone()).is_terminal());

        progress.total_bytes = 0;
        assert_eq!(progress.fraction(), 1.0);
    }
}
