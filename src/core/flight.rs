//! In-flight operation tracking
//!
//! A `Flight` is a one-shot completion cell many threads can wait on.
//! A `FlightSlot` admits at most one flight at a time:
//! 1. The first caller of `try_begin` becomes the *Fetcher* and receives a
//!    `FlightGuard`
//! 2. Callers arriving while the slot is taken become *Waiters* and block on
//!    the shared flight
//! 3. Dropping the guard frees the slot and wakes every waiter
//!
//! Releasing on drop keeps the slot consistent even when the fetcher bails
//! out early with `?` or panics.

use std::fmt::Debug;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// One-shot completion shared between a fetcher and its waiters
#[derive(Debug)]
pub struct Flight<T> {
    outcome: Mutex<Option<T>>,
    done: Condvar,
}

impl<T: Clone> Flight<T> {
    pub fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    /// Store the outcome and wake waiters. Later calls are ignored.
    pub fn complete(&self, value: T) {
        let mut outcome = self.outcome.lock().unwrap_or_else(|e| e.into_inner());
        if outcome.is_none() {
            *outcome = Some(value);
            self.done.notify_all();
        }
    }

    pub fn is_complete(&self) -> bool {
        self.outcome.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Block until completed
    pub fn wait(&self) -> T {
        let mut outcome = self.outcome.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(value) = outcome.as_ref() {
                return value.clone();
            }
            outcome = self.done.wait(outcome).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Block until completed or `timeout` elapsed
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let outcome = self.outcome.lock().unwrap_or_else(|e| e.into_inner());
        let (outcome, _) = self
            .done
            .wait_timeout_while(outcome, timeout, |o| o.is_none())
            .unwrap_or_else(|e| e.into_inner());
        outcome.clone()
    }
}

impl<T: Clone> Default for Flight<T> {
    fn default() -> Self {
        Self::new()
    }
}

type Active<K> = Arc<Mutex<Option<(K, Arc<Flight<()>>)>>>;

/// Slot admitting one in-flight operation at a time
#[derive(Debug)]
pub struct FlightSlot<K> {
    active: Active<K>,
}

/// Role assigned by `FlightSlot::try_begin`
pub enum FlightRole<K: Copy + Debug> {
    /// Slot was free; caller performs the operation
    Fetcher(FlightGuard<K>),
    /// Slot is taken by an operation on the given key
    Waiter(K, Arc<Flight<()>>),
}

/// Ownership of the slot. Dropping it frees the slot and wakes waiters.
pub struct FlightGuard<K: Copy + Debug> {
    key: K,
    flight: Arc<Flight<()>>,
    active: Active<K>,
}

impl<K: Copy + Debug> FlightSlot<K> {
    pub fn new() -> Self {
        Self {
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub fn try_begin(&self, key: K) -> FlightRole<K> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        match active.as_ref() {
            Some((active_key, flight)) => FlightRole::Waiter(*active_key, Arc::clone(flight)),
            None => {
                let flight = Arc::new(Flight::new());
                *active = Some((key, Arc::clone(&flight)));
                FlightRole::Fetcher(FlightGuard {
                    key,
                    flight,
                    active: Arc::clone(&self.active),
                })
            }
        }
    }

    /// Flight currently holding the slot
    pub fn current(&self) -> Option<Arc<Flight<()>>> {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|(_, flight)| Arc::clone(flight))
    }

    pub fn active_key(&self) -> Option<K> {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|(key, _)| *key)
    }

    pub fn is_idle(&self) -> bool {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }

    /// Block until the slot is free at the moment of checking
    pub fn wait_idle(&self) {
        while let Some(flight) = self.current() {
            flight.wait();
        }
    }
}

impl<K: Copy + Debug> Default for FlightSlot<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Copy + Debug> FlightGuard<K> {
    pub fn key(&self) -> K {
        self.key
    }

    /// Release the slot now (same as dropping the guard)
    pub fn finish(self) {}
}

impl<K: Copy + Debug> Drop for FlightGuard<K> {
    fn drop(&mut self) {
        {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            let ours = matches!(active.as_ref(), Some((_, f)) if Arc::ptr_eq(f, &self.flight));
            if ours {
                *active = None;
            }
        }
        self.flight.complete(());
        log::trace!("flight {:?} released", self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_first_caller_is_fetcher() {
        let slot = FlightSlot::new();
        let guard = match slot.try_begin(3usize) {
            FlightRole::Fetcher(guard) => guard,
            FlightRole::Waiter(..) => panic!("slot should be free"),
        };
        assert_eq!(slot.active_key(), Some(3));

        match slot.try_begin(4) {
            FlightRole::Waiter(key, flight) => {
                assert_eq!(key, 3);
                assert!(!flight.is_complete());
                guard.finish();
                assert!(flight.is_complete());
            }
            FlightRole::Fetcher(_) => panic!("slot should be taken"),
        }
        assert!(slot.is_idle());
    }

    #[test]
    fn test_guard_drop_wakes_waiters() {
        let slot = Arc::new(FlightSlot::new());
        let guard = match slot.try_begin(0usize) {
            FlightRole::Fetcher(guard) => guard,
            FlightRole::Waiter(..) => unreachable!(),
        };

        let woken = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let slot = Arc::clone(&slot);
                let woken = Arc::clone(&woken);
                thread::spawn(move || {
                    slot.wait_idle();
                    woken.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        assert_eq!(woken.load(Ordering::SeqCst), 0);
        drop(guard);
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(woken.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_flight_value_shared() {
        let flight: Arc<Flight<Result<u32, String>>> = Arc::new(Flight::new());
        let waiter = {
            let flight = Arc::clone(&flight);
            thread::spawn(move || flight.wait())
        };
        flight.complete(Ok(7));
        flight.complete(Err("ignored".into()));
        assert_eq!(waiter.join().unwrap(), Ok(7));
        assert_eq!(flight.wait_timeout(Duration::from_millis(1)), Some(Ok(7)));
    }

    #[test]
    fn test_wait_timeout_expires() {
        let flight: Flight<()> = Flight::new();
        assert_eq!(flight.wait_timeout(Duration::from_millis(5)), None);
    }
}
