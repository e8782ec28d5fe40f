//! Mock WriteHandler for testing.
//!
//! Records every intent it receives. By default it commits the intent to a
//! [`MemoryShapeSource`] and returns the resulting txid, which is what a real
//! backend does. It can also acknowledge with a fixed txid without
//! committing (nothing ever confirms), reject, hold calls behind a gate, or
//! delay its answer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sync_collection::store::Row;
use sync_collection::write::{MutationIntent, WriteAck, WriteError, WriteFuture, WriteHandler};
use sync_collection::{ChangeOp, MemoryShapeSource};
use tokio::sync::Semaphore;

/// How the mock answers.
#[derive(Debug, Clone)]
pub enum WriteMode {
    /// Commit to the source and return its txid.
    Commit,
    /// Return this txid without touching the source.
    Ack(u64),
    /// Fail every call with this message.
    Reject(String),
}

/// Mock implementation of WriteHandler that records all calls.
///
/// # Example
/// ```rust,ignore
/// let writer = MockWriter::new(Arc::clone(&source));
/// writer.next_txid(42);
///
/// // Use in tests...
///
/// assert_eq!(writer.intents().len(), 1);
/// ```
pub struct MockWriter {
    source: Arc<MemoryShapeSource>,
    mode: Mutex<WriteMode>,
    intents: Mutex<Vec<MutationIntent>>,
    /// Txid for the next commit instead of the source's counter
    next_txid: Mutex<Option<u64>>,
    /// Sleep between commit and reply
    ack_delay: Mutex<Option<Duration>>,
    gated: AtomicBool,
    gate: Semaphore,
}

impl MockWriter {
    /// Create a mock that commits every intent to `source`.
    pub fn new(source: Arc<MemoryShapeSource>) -> Arc<Self> {
        Arc::new(Self {
            source,
            mode: Mutex::new(WriteMode::Commit),
            intents: Mutex::new(Vec::new()),
            next_txid: Mutex::new(None),
            ack_delay: Mutex::new(None),
            gated: AtomicBool::new(false),
            gate: Semaphore::new(0),
        })
    }

    /// Create a mock that rejects everything.
    pub fn rejecting(source: Arc<MemoryShapeSource>, message: &str) -> Arc<Self> {
        let writer = Self::new(source);
        writer.set_mode(WriteMode::Reject(message.to_string()));
        writer
    }

    /// Create a mock that acknowledges with a txid that never shows up.
    pub fn acking(source: Arc<MemoryShapeSource>, txid: u64) -> Arc<Self> {
        let writer = Self::new(source);
        writer.set_mode(WriteMode::Ack(txid));
        writer
    }

    pub fn set_mode(&self, mode: WriteMode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Use `txid` for the next commit.
    pub fn next_txid(&self, txid: u64) {
        *self.next_txid.lock().unwrap() = Some(txid);
    }

    /// Wait `delay` after committing before replying.
    pub fn set_ack_delay(&self, delay: Duration) {
        *self.ack_delay.lock().unwrap() = Some(delay);
    }

    /// Hold every call until [`release`](Self::release) is called.
    pub fn close_gate(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    /// Let `n` held calls through.
    #[allow(dead_code)]
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    /// Intents received so far, in call order.
    pub fn intents(&self) -> Vec<MutationIntent> {
        self.intents.lock().unwrap().clone()
    }

    async fn handle(&self, intent: MutationIntent) -> Result<WriteAck, WriteError> {
        self.intents.lock().unwrap().push(intent.clone());

        if self.gated.load(Ordering::SeqCst) {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
        }

        let mode = self.mode.lock().unwrap().clone();
        let ack = match mode {
            WriteMode::Reject(message) => return Err(WriteError::new(message)),
            WriteMode::Ack(txid) => WriteAck::new(txid),
            WriteMode::Commit => {
                let txn = self.source.transaction();
                let txn = match intent.kind {
                    ChangeOp::Insert => txn.insert(intent.key.clone(), intent.changes.clone()),
                    ChangeOp::Update => txn.update(intent.key.clone(), intent.changes.clone()),
                    ChangeOp::Delete => txn.delete(intent.key.clone()),
                };
                let txid = self.next_txid.lock().unwrap().take();
                let txn = match txid {
                    Some(txid) => txn.txid(txid),
                    None => txn,
                };
                WriteAck::new(txn.commit())
            }
        };

        let delay = *self.ack_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(ack)
    }
}

impl WriteHandler for MockWriter {
    fn on_insert(&self, intent: MutationIntent) -> WriteFuture<'_> {
        Box::pin(self.handle(intent))
    }

    fn on_update(&self, intent: MutationIntent) -> WriteFuture<'_> {
        Box::pin(self.handle(intent))
    }

    fn on_delete(&self, intent: MutationIntent) -> WriteFuture<'_> {
        Box::pin(self.handle(intent))
    }
}

/// Field of a recorded row, for assertions.
#[allow(dead_code)]
pub fn field<'a>(row: &'a Option<Row>, name: &str) -> Option<&'a serde_json::Value> {
    row.as_ref().and_then(|r| r.get(name))
}
