//! Change signaling
//!
//! Data items signal the sequence number of each new observation; waiting
//! consumers (long-poll streams) observe the smallest sequence signaled
//! since their last reset. Observers deregister automatically when
//! dropped: signalers hold only weak references, so no notification can
//! fire into a destroyed observer.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::Notify;

use types::{SequenceNumber, UNSIGNALED};

#[derive(Debug)]
struct ObserverShared {
    sequence: Mutex<SequenceNumber>,
    notify: Notify,
}

/// One waiting consumer. Stores the earliest sequence signaled since the
/// last [`reset`](ChangeObserver::reset).
#[derive(Debug)]
pub struct ChangeObserver {
    shared: Arc<ObserverShared>,
}

impl Default for ChangeObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeObserver {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ObserverShared {
                sequence: Mutex::new(UNSIGNALED),
                notify: Notify::new(),
            }),
        }
    }

    pub fn was_signaled(&self) -> bool {
        *self.shared.sequence.lock().unwrap() != UNSIGNALED
    }

    /// Earliest sequence signaled since the last reset
    pub fn sequence(&self) -> Option<SequenceNumber> {
        let seq = *self.shared.sequence.lock().unwrap();
        (seq != UNSIGNALED).then_some(seq)
    }

    /// Return to the unsignaled state
    pub fn reset(&self) {
        *self.shared.sequence.lock().unwrap() = UNSIGNALED;
    }

    /// Wait until signaled or the timeout elapses. Returns `true` when a
    /// signal arrived (including before the call). A signal that lands
    /// between the state check and the sleep is not lost: the notify permit
    /// is claimed on the next loop turn.
    pub async fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.shared.notify.notified();
            if self.was_signaled() {
                return true;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return self.was_signaled(),
            }
        }
    }
}

/// Signals attached observers with new sequence numbers
#[derive(Debug, Default)]
pub struct ChangeSignaler {
    observers: Mutex<Vec<Weak<ObserverShared>>>,
}

impl ChangeSignaler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_observer(&self, observer: &ChangeObserver) {
        self.observers
            .lock()
            .unwrap()
            .push(Arc::downgrade(&observer.shared));
    }

    pub fn remove_observer(&self, observer: &ChangeObserver) -> bool {
        let mut observers = self.observers.lock().unwrap();
        let before = observers.len();
        observers.retain(|weak| {
            weak.upgrade()
                .is_some_and(|shared| !Arc::ptr_eq(&shared, &observer.shared))
        });
        observers.len() < before
    }

    pub fn has_observer(&self, observer: &ChangeObserver) -> bool {
        self.observers
            .lock()
            .unwrap()
            .iter()
            .any(|weak| {
                weak.upgrade()
                    .is_some_and(|shared| Arc::ptr_eq(&shared, &observer.shared))
            })
    }

    /// Record `sequence` on every live observer that has not already seen an
    /// earlier one, and wake them. Sequence 0 is not a valid signal.
    pub fn signal(&self, sequence: SequenceNumber) {
        let mut observers = self.observers.lock().unwrap();
        observers.retain(|weak| {
            let Some(shared) = weak.upgrade() else {
                return false;
            };
            {
                let mut current = shared.sequence.lock().unwrap();
                if *current > sequence && sequence != 0 {
                    *current = sequence;
                }
            }
            shared.notify.notify_one();
            true
        });
    }

    pub fn observer_count(&self) -> usize {
        self.observers
            .lock()
            .unwrap()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_remove_observer() {
        let signaler = ChangeSignaler::new();
        let observer = ChangeObserver::new();

        assert!(!signaler.has_observer(&observer));
        signaler.add_observer(&observer);
        assert!(signaler.has_observer(&observer));
        assert!(signaler.remove_observer(&observer));
        assert!(!signaler.has_observer(&observer));
    }

    #[test]
    fn dropping_observer_deregisters_it() {
        let signaler = ChangeSignaler::new();
        {
            let observer = ChangeObserver::new();
            signaler.add_observer(&observer);
            assert_eq!(1, signaler.observer_count());
        }
        assert_eq!(0, signaler.observer_count());
        // Signaling after the drop is a no-op, not a dangling notification.
        signaler.signal(10);
    }

    #[test]
    fn earliest_sequence_wins() {
        let signaler = ChangeSignaler::new();
        let observer = ChangeObserver::new();
        signaler.add_observer(&observer);

        observer.reset();
        signaler.signal(10);
        signaler.signal(5);
        signaler.signal(20);
        assert_eq!(Some(5), observer.sequence());
    }

    #[test]
    fn later_lower_sequence_still_wins() {
        let signaler = ChangeSignaler::new();
        let observer = ChangeObserver::new();
        signaler.add_observer(&observer);

        signaler.signal(100);
        signaler.signal(200);
        signaler.signal(300);
        signaler.signal(30);
        assert_eq!(Some(30), observer.sequence());
    }

    #[test]
    fn zero_is_not_a_signal_value() {
        let signaler = ChangeSignaler::new();
        let observer = ChangeObserver::new();
        signaler.add_observer(&observer);

        signaler.signal(0);
        assert!(!observer.was_signaled());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_returns_true_on_signal() {
        let signaler = Arc::new(ChangeSignaler::new());
        let observer = ChangeObserver::new();
        signaler.add_observer(&observer);

        let sig = Arc::clone(&signaler);
        let waiter = async {
            observer.wait_for(Duration::from_secs(2)).await
        };
        let trigger = async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            sig.signal(100);
        };
        let (signaled, ()) = tokio::join!(waiter, trigger);
        assert!(signaled);
        assert_eq!(Some(100), observer.sequence());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_without_signal() {
        let observer = ChangeObserver::new();
        let signaled = observer.wait_for(Duration::from_millis(250)).await;
        assert!(!signaled);
        assert!(!observer.was_signaled());
    }

    #[tokio::test(start_paused = true)]
    async fn signal_before_wait_is_not_lost() {
        let signaler = ChangeSignaler::new();
        let observer = ChangeObserver::new();
        signaler.add_observer(&observer);

        signaler.signal(7);
        assert!(observer.wait_for(Duration::from_millis(1)).await);

        observer.reset();
        assert!(!observer.was_signaled());
    }
}
