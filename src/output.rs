//! Per-job output journal: a bounded tail of recent chunks for status
//! queries, and a live feed that watchers can attach to at any time.
//!
//! Recording, finishing and attaching all happen under one lock, so a
//! watcher sees the tail followed by every later event, with no gap and no
//! duplicate.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tonic::Status;
use tracing::{debug, warn};

use crate::proto::execution_event::Event;
use crate::proto::{ExecutionEvent, OutputChunk, Terminal};

/// Bytes of recent output kept per job.
pub const TAIL_BYTES: usize = 16 * 1024;

const LIVE_CAPACITY: usize = 256;
const WATCH_BUFFER: usize = 64;

pub type WatchReceiver = mpsc::Receiver<Result<ExecutionEvent, Status>>;

#[derive(Default)]
struct Journal {
    tail: VecDeque<OutputChunk>,
    bytes: usize,
    terminal: Option<Terminal>,
}

impl Journal {
    /// Append, then evict the oldest chunks until the tail fits. A chunk
    /// larger than the whole tail keeps only its last `capacity` bytes.
    fn push(&mut self, mut chunk: OutputChunk, capacity: usize) {
        if chunk.data.len() > capacity {
            let excess = chunk.data.len() - capacity;
            chunk.data.drain(..excess);
        }
        self.bytes += chunk.data.len();
        self.tail.push_back(chunk);
        while self.bytes > capacity {
            match self.tail.pop_front() {
                Some(old) => self.bytes -= old.data.len(),
                None => break,
            }
        }
    }
}

pub struct OutputLog {
    journal: Mutex<Journal>,
    live: broadcast::Sender<ExecutionEvent>,
    capacity: usize,
}

impl Default for OutputLog {
    fn default() -> Self {
        Self::new(TAIL_BYTES)
    }
}

impl OutputLog {
    pub fn new(capacity: usize) -> Self {
        let (live, _) = broadcast::channel(LIVE_CAPACITY);
        Self {
            journal: Mutex::new(Journal::default()),
            live,
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Journal> {
        self.journal.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ignored once the log is finished.
    pub fn record(&self, chunk: &OutputChunk) {
        let mut journal = self.lock();
        if journal.terminal.is_some() {
            return;
        }
        journal.push(chunk.clone(), self.capacity);
        let _ = self.live.send(ExecutionEvent {
            event: Some(Event::Chunk(chunk.clone())),
        });
    }

    /// Close the log with the job's terminal. Only the first call counts.
    pub fn finish(&self, terminal: &Terminal) -> bool {
        let mut journal = self.lock();
        if journal.terminal.is_some() {
            return false;
        }
        journal.terminal = Some(terminal.clone());
        let _ = self.live.send(ExecutionEvent::terminal(terminal.clone()));
        true
    }

    pub fn recent(&self) -> Vec<OutputChunk> {
        self.lock().tail.iter().cloned().collect()
    }

    /// Replay the tail, then follow live output until the terminal event.
    /// A watcher that falls too far behind gets `DATA_LOSS` and is detached.
    pub fn follow(&self) -> WatchReceiver {
        let (backlog, finished, mut live) = {
            let journal = self.lock();
            (
                journal.tail.iter().cloned().collect::<Vec<_>>(),
                journal.terminal.clone(),
                self.live.subscribe(),
            )
        };

        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        tokio::spawn(async move {
            for chunk in backlog {
                let event = ExecutionEvent {
                    event: Some(Event::Chunk(chunk)),
                };
                if tx.send(Ok(event)).await.is_err() {
                    return;
                }
            }
            if let Some(terminal) = finished {
                let _ = tx.send(Ok(ExecutionEvent::terminal(terminal))).await;
                return;
            }
            loop {
                match live.recv().await {
                    Ok(event) => {
                        let last = matches!(event.event, Some(Event::Terminal(_)));
                        if tx.send(Ok(event)).await.is_err() || last {
                            return;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "watcher fell behind, detaching");
                        let status = Status::data_loss(format!("watcher missed {} events", missed));
                        let _ = tx.send(Err(status)).await;
                        return;
                    }
                    Err(RecvError::Closed) => {
                        debug!("output log dropped while being watched");
                        return;
                    }
                }
            }
        });
        rx
    }
}
