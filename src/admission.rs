//! Global concurrency budget with a bounded FIFO of waiting requests.
//!
//! All state lives behind one mutex. A slot is represented by a
//! [`SlotPermit`]; dropping the permit either hands the slot to the oldest
//! live waiter or returns it to the pool, so a slot is released on every
//! exit path including panics.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{ExecutorError, Result};

struct AdmissionState {
    running: usize,
    waiters: VecDeque<oneshot::Sender<SlotPermit>>,
}

struct Shared {
    max_running: usize,
    queue_depth: usize,
    state: Mutex<AdmissionState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, AdmissionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Clone)]
pub struct Admission {
    shared: Arc<Shared>,
}

impl Admission {
    pub fn new(max_running: usize, queue_depth: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                max_running,
                queue_depth,
                state: Mutex::new(AdmissionState {
                    running: 0,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    /// Take a slot if one is free, otherwise join the queue. Fails with
    /// `CapacityExceeded` when the queue is full as well.
    pub fn admit(&self) -> Result<Ticket> {
        let mut state = self.shared.lock();
        if state.running < self.shared.max_running {
            state.running += 1;
            return Ok(Ticket::Granted(SlotPermit::new(&self.shared)));
        }

        state.waiters.retain(|waiter| !waiter.is_closed());
        if state.waiters.len() >= self.shared.queue_depth {
            return Err(ExecutorError::CapacityExceeded {
                running: state.running,
                queued: state.waiters.len(),
            });
        }
        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(tx);
        debug!(queued = state.waiters.len(), "request queued for a sandbox slot");
        Ok(Ticket::Queued(rx))
    }

    /// `admit` followed by waiting for the slot.
    pub async fn acquire(&self) -> Result<SlotPermit> {
        self.admit()?
            .wait()
            .await
            .ok_or_else(|| ExecutorError::Internal("admission queue closed".into()))
    }

    /// Slots currently held.
    pub fn in_use(&self) -> usize {
        self.shared.lock().running
    }

    /// Live waiters in the queue.
    pub fn queued(&self) -> usize {
        self.shared
            .lock()
            .waiters
            .iter()
            .filter(|waiter| !waiter.is_closed())
            .count()
    }

    pub fn capacity(&self) -> usize {
        self.shared.max_running
    }
}

/// Result of admission: a slot now, or a place in the queue. Dropping a
/// queued ticket leaves the queue.
pub enum Ticket {
    Granted(SlotPermit),
    Queued(oneshot::Receiver<SlotPermit>),
}

impl Ticket {
    pub fn is_queued(&self) -> bool {
        matches!(self, Ticket::Queued(_))
    }

    pub async fn wait(self) -> Option<SlotPermit> {
        match self {
            Ticket::Granted(permit) => Some(permit),
            Ticket::Queued(rx) => rx.await.ok(),
        }
    }
}

/// One unit of the concurrency budget.
pub struct SlotPermit {
    shared: Option<Arc<Shared>>,
}

impl SlotPermit {
    fn new(shared: &Arc<Shared>) -> Self {
        Self {
            shared: Some(Arc::clone(shared)),
        }
    }
}

impl std::fmt::Debug for SlotPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPermit").finish_non_exhaustive()
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        loop {
            let waiter = {
                let mut state = shared.lock();
                match state.waiters.pop_front() {
                    Some(waiter) => waiter,
                    None => {
                        state.running -= 1;
                        return;
                    }
                }
            };
            // The slot moves to the waiter; `running` is unchanged.
            match waiter.send(SlotPermit::new(&shared)) {
                Ok(()) => return,
                Err(mut unclaimed) => {
                    // Waiter gave up; disarm and try the next one.
                    unclaimed.shared = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn grants_up_to_budget_then_queues_then_rejects() {
        let admission = Admission::new(2, 1);
        let a = admission.admit().unwrap();
        let b = admission.admit().unwrap();
        assert!(!a.is_queued() && !b.is_queued());

        let c = admission.admit().unwrap();
        assert!(c.is_queued());
        assert_eq!(admission.queued(), 1);

        match admission.admit() {
            Err(ExecutorError::CapacityExceeded { running, queued }) => {
                assert_eq!(running, 2);
                assert_eq!(queued, 1);
            }
            _ => panic!("expected capacity rejection"),
        }
        assert_eq!(admission.in_use(), 2);
    }

    #[tokio::test]
    async fn released_slot_goes_to_oldest_waiter() {
        let admission = Admission::new(1, 4);
        let first = admission.acquire().await.unwrap();
        let second = admission.admit().unwrap();
        let third = admission.admit().unwrap();

        drop(first);
        let permit = tokio::time::timeout(Duration::from_secs(1), second.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(admission.in_use(), 1);
        assert_eq!(admission.queued(), 1);

        drop(permit);
        let last = third.wait().await.unwrap();
        drop(last);
        assert_eq!(admission.in_use(), 0);
    }

    #[tokio::test]
    async fn abandoned_waiter_does_not_leak_the_slot() {
        let admission = Admission::new(1, 2);
        let held = admission.acquire().await.unwrap();
        let abandoned = admission.admit().unwrap();
        let patient = admission.admit().unwrap();
        drop(abandoned);

        drop(held);
        let permit = patient.wait().await.unwrap();
        assert_eq!(admission.in_use(), 1);
        drop(permit);
        assert_eq!(admission.in_use(), 0);
    }

    #[tokio::test]
    async fn abandoned_waiters_free_queue_space() {
        let admission = Admission::new(1, 1);
        let _held = admission.acquire().await.unwrap();
        let waiter = admission.admit().unwrap();
        assert!(admission.admit().is_err());
        drop(waiter);
        assert!(admission.admit().is_ok());
    }

    #[tokio::test]
    async fn permit_sent_to_dropped_receiver_is_returned() {
        let admission = Admission::new(1, 1);
        let held = admission.acquire().await.unwrap();
        let waiter = admission.admit().unwrap();
        // Hand-off completes, then the receiver is dropped unread.
        drop(held);
        drop(waiter);
        assert_eq!(admission.in_use(), 0);
        assert!(!admission.admit().unwrap().is_queued());
    }
}
