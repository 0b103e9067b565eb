pub mod analysis;
pub mod app;
pub mod chat;
pub mod config;
pub mod error;
pub mod visualizations;

use std::sync::{Mutex, MutexGuard};

pub use analysis::*;
pub use app::*;
pub use chat::*;
pub use config::*;
pub use error::*;
pub use visualizations::*;

/// Settlement handlers never hold a guard across an await, so a poisoned
/// lock still holds a consistent value.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Settles a request whose task ends before reaching its own settlement.
///
/// A backend panic unwinds through the task and an aborted task drops its
/// future; either way the guard runs `on_drop` unless it was disarmed first.
pub(crate) struct SettleOnDrop<F: FnOnce()> {
    on_drop: Option<F>,
}

impl<F: FnOnce()> SettleOnDrop<F> {
    pub(crate) fn new(on_drop: F) -> Self {
        Self {
            on_drop: Some(on_drop),
        }
    }

    pub(crate) fn disarm(mut self) {
        self.on_drop = None;
    }
}

impl<F: FnOnce()> Drop for SettleOnDrop<F> {
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            on_drop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn settle_on_drop_runs_once_when_dropped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        drop(SettleOnDrop::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disarmed_guard_does_nothing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        SettleOnDrop::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .disarm();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn lock_recovers_from_poison() {
        let mutex = Arc::new(Mutex::new(1));
        let poisoner = mutex.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison");
        })
        .join();
        assert!(mutex.is_poisoned());
        *lock(&mutex) += 1;
        assert_eq!(*lock(&mutex), 2);
    }
}
