//! One-shot signal carrying a value
//!
//! Set once from any context (including completion callbacks), waited on
//! from the caller context.
//!
//! The slot sits behind a `std::sync::Mutex` because the `Condvar` waiters
//! park on needs one. Completion context may still set it: waiters hold the
//! lock only to test the slot and release it while parked, and `set` does a
//! single store and notify, so a setter never waits on anything longer than
//! another setter or reader's check of the slot.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

pub struct Event<T> {
    slot: Mutex<Option<T>>,
    signalled: Condvar,
}

impl<T> Default for Event<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Event<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            signalled: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        // A panicking setter cannot leave the slot half-written
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Signal the event. The first value wins; returns false if already set.
    pub fn set(&self, value: T) -> bool {
        let mut slot = self.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        self.signalled.notify_all();
        true
    }

    pub fn is_set(&self) -> bool {
        self.lock().is_some()
    }

    /// Block until set or `timeout` elapses. Returns whether the event is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let slot = self.lock();
        let (slot, _) = self
            .signalled
            .wait_timeout_while(slot, timeout, |value| value.is_none())
            .unwrap_or_else(|e| e.into_inner());
        slot.is_some()
    }

    /// Block until set
    pub fn wait(&self) {
        let slot = self.lock();
        let _slot = self
            .signalled
            .wait_while(slot, |value| value.is_none())
            .unwrap_or_else(|e| e.into_inner());
    }

    /// Take the value out, leaving the event unset
    pub fn take(&self) -> Option<T> {
        self.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_first_value_wins() {
        let event = Event::new();
        assert!(event.set(1));
        assert!(!event.set(2));
        assert_eq!(event.take(), Some(1));
        assert!(!event.is_set());
    }

    #[test]
    fn test_wait_timeout_expires() {
        let event: Event<()> = Event::new();
        let start = Instant::now();
        assert!(!event.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_wait_wakes_on_set_from_other_thread() {
        let event = Arc::new(Event::new());
        let setter = {
            let event = event.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                event.set("done");
            })
        };

        event.wait();
        assert_eq!(event.take(), Some("done"));
        setter.join().unwrap();
    }

    #[test]
    fn test_racing_setters_never_block_on_parked_waiters() {
        let event = Arc::new(Event::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let event = event.clone();
                std::thread::spawn(move || event.wait_timeout(Duration::from_secs(5)))
            })
            .collect();
        std::thread::sleep(Duration::from_millis(10));

        let setters: Vec<_> = (0..4)
            .map(|n| {
                let event = event.clone();
                std::thread::spawn(move || event.set(n))
            })
            .collect();
        let winners = setters
            .into_iter()
            .map(|s| s.join().unwrap())
            .filter(|&won| won)
            .count();

        assert_eq!(winners, 1);
        assert!(waiters.into_iter().all(|w| w.join().unwrap()));
    }
}
