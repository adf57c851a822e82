//! Chat envelopes, the outbound queue, chunked file transfer and delivery
//! acknowledgement.

pub mod ack;
pub mod queue;
pub mod transfer;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub use ack::{Author, ChatEntry, ChatLog, DELAY_THRESHOLD_MS, DeliveryState};
pub use queue::{FileSource, MessageQueue, Outgoing, OutgoingFile};
pub use transfer::{
    CHUNK_SIZE, FileReceiver, FileSender, ReceiveProgress, ReceivedFile, TransferError,
    TransferPolicy, negotiate_binary_type,
};

/// Milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn starting_at(ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(ms)),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Hands out content timestamps. Timestamps double as message ids, so two
/// messages sent within the same millisecond still get distinct values.
pub struct Stamper {
    clock: Arc<dyn Clock>,
    last: AtomicU64,
}

impl Stamper {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            last: AtomicU64::new(0),
        }
    }

    pub fn next(&self) -> u64 {
        let now = self.clock.now_ms();
        let mut last = self.last.load(Ordering::Acquire);
        loop {
            let candidate = now.max(last + 1);
            match self
                .last
                .compare_exchange(last, candidate, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return candidate,
                Err(actual) => last = actual,
            }
        }
    }

    /// Current time, for acknowledgements. Not unique.
    pub fn now(&self) -> u64 {
        self.clock.now_ms()
    }
}
