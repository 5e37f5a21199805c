//--------------------------------------------------------------------------------------------------
// STRUCTS
//--------------------------------------------------------------------------------------------------
// | Name               | Description                                          | Key Methods             |
// |--------------------|------------------------------------------------------|-------------------------|
// | MemoryChangeFeed   | In-process order change log implementing ChangeFeed  | commit_*, open, close   |
// | MemoryCursor       | Cursor over the in-process log                       | next_change             |
//--------------------------------------------------------------------------------------------------

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use super::{ChangeCursor, ChangeFeed, ChangeSourceError, SourceResult};
use crate::domain::models::types::{ChangeOperation, ChangeRecord, ResumeToken};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FeedState {
    len: usize,
    closed: bool,
}

#[derive(Debug)]
struct FeedInner {
    log: Mutex<Vec<ChangeRecord>>,
    state: watch::Sender<FeedState>,
    /// Failures returned by a cursor about to read the record at a position
    read_faults: Mutex<Vec<(usize, ChangeSourceError)>>,
    open_faults: Mutex<Vec<ChangeSourceError>>,
    opens: AtomicUsize,
}

/// An in-process order log that behaves like a database change stream.
///
/// Resume tokens are 1-based positions in the log: resuming after token `n`
/// yields record `n + 1` next. Failures can be scheduled at a given log
/// position to exercise the adapter's retry path.
#[derive(Debug, Clone)]
pub struct MemoryChangeFeed {
    inner: Arc<FeedInner>,
}

impl Default for MemoryChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChangeFeed {
    pub fn new() -> Self {
        let (state, _) = watch::channel(FeedState { len: 0, closed: false });
        Self {
            inner: Arc::new(FeedInner {
                log: Mutex::new(Vec::new()),
                state,
                read_faults: Mutex::new(Vec::new()),
                open_faults: Mutex::new(Vec::new()),
                opens: AtomicUsize::new(0),
            }),
        }
    }

    /// Records an order insert. `document` must carry the order fields.
    pub fn commit_insert(&self, order_id: &str, document: Value) -> ResumeToken {
        self.commit(ChangeOperation::Insert, order_id, Some(document))
    }

    /// Records a modification of an existing order.
    pub fn commit_update(&self, order_id: &str, document: Value) -> ResumeToken {
        self.commit(ChangeOperation::Update, order_id, Some(document))
    }

    pub fn commit_delete(&self, order_id: &str) -> ResumeToken {
        self.commit(ChangeOperation::Delete, order_id, None)
    }

    /// Appends a raw change record and wakes every waiting cursor.
    pub fn commit(
        &self,
        operation: ChangeOperation,
        order_id: &str,
        full_document: Option<Value>,
    ) -> ResumeToken {
        let mut log = self.inner.log.lock();
        let resume_token = ResumeToken((log.len() + 1).to_string());

        log.push(ChangeRecord {
            resume_token: resume_token.clone(),
            operation,
            document_key: Value::String(order_id.to_string()),
            full_document,
            committed_at: Utc::now(),
        });

        let len = log.len();
        self.inner.state.send_modify(|state| state.len = len);
        debug!("Committed {:?} for order {} as change {}", operation, order_id, resume_token);

        resume_token
    }

    /// Makes the cursor that is about to read log position `position`
    /// (0-based) fail once with `error`.
    pub fn fail_at(&self, position: usize, error: ChangeSourceError) {
        self.inner.read_faults.lock().push((position, error));
    }

    /// Makes the next call to `open` fail with `error`.
    pub fn fail_next_open(&self, error: ChangeSourceError) {
        self.inner.open_faults.lock().push(error);
    }

    /// Ends the feed. Cursors drain the remaining records, then return `None`.
    pub fn close(&self) {
        self.inner.state.send_modify(|state| state.closed = true);
    }

    /// Number of successful and failed `open` calls so far.
    pub fn open_count(&self) -> usize {
        self.inner.opens.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.inner.log.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ChangeFeed for MemoryChangeFeed {
    async fn open(&self, resume_after: Option<ResumeToken>) -> SourceResult<Box<dyn ChangeCursor>> {
        {
            let mut faults = self.inner.open_faults.lock();
            if !faults.is_empty() {
                self.inner.opens.fetch_add(1, Ordering::SeqCst);
                return Err(faults.remove(0));
            }
        }

        let position = match resume_after {
            Some(token) => token.0.parse::<usize>().map_err(|_| {
                ChangeSourceError::Fatal(format!("unknown resume token {}", token))
            })?,
            None => self.len(),
        };
        if position > self.len() {
            return Err(ChangeSourceError::Fatal(format!(
                "resume token {} not in feed history ({} changes)",
                position,
                self.len()
            )));
        }
        // counted once the start position is fixed
        self.inner.opens.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MemoryCursor {
            inner: Arc::clone(&self.inner),
            state: self.inner.state.subscribe(),
            position,
        }))
    }
}

/// Cursor over a `MemoryChangeFeed`.
#[derive(Debug)]
pub struct MemoryCursor {
    inner: Arc<FeedInner>,
    state: watch::Receiver<FeedState>,
    position: usize,
}

impl MemoryCursor {
    fn take_fault(&self) -> Option<ChangeSourceError> {
        let mut faults = self.inner.read_faults.lock();
        let index = faults.iter().position(|(at, _)| *at == self.position)?;
        Some(faults.remove(index).1)
    }
}

#[async_trait]
impl ChangeCursor for MemoryCursor {
    async fn next_change(&mut self) -> SourceResult<Option<ChangeRecord>> {
        loop {
            if let Some(error) = self.take_fault() {
                return Err(error);
            }

            let state = *self.state.borrow_and_update();
            if self.position < state.len {
                let record = self.inner.log.lock()[self.position].clone();
                self.position += 1;
                return Ok(Some(record));
            }
            if state.closed {
                return Ok(None);
            }

            // The sender lives in `inner`, which this cursor keeps alive
            if self.state.changed().await.is_err() {
                return Ok(None);
            }
        }
    }
}
