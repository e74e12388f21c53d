// src/exchange/completion.rs
//! Single-writer, complete-once cell.
//!
//! The writer stores the value and signals the condition variable while
//! holding the lock, and blocking readers re-check the value under that same
//! lock before sleeping, so a wakeup can never fall between a reader's check
//! and its wait. `is_complete` is a lock-free fast path for readers that only
//! need to know whether a value exists. Async readers register with the
//! `Notify` before checking, which gives them the same guarantee.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

type Callback<T> = Box<dyn FnOnce(T) + Send>;

struct Slot<T> {
    value: Option<T>,
    callback: Option<Callback<T>>,
}

pub struct Completion<T> {
    done: AtomicBool,
    state: Mutex<Slot<T>>,
    ready: Condvar,
    notify: Notify,
}

impl<T: Clone + Send + 'static> Completion<T> {
    pub fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            state: Mutex::new(Slot {
                value: None,
                callback: None,
            }),
            ready: Condvar::new(),
            notify: Notify::new(),
        }
    }

    /// Stores `value` if the cell is still empty and wakes every waiter.
    ///
    /// Returns `false` (dropping `value`) when another writer got there first.
    /// A registered callback runs on the calling thread after the lock is released.
    pub fn complete(&self, value: T) -> bool {
        let pending_callback = {
            let mut slot = self.state.lock();
            if slot.value.is_some() {
                return false;
            }
            let pending_callback = slot.callback.take().map(|callback| (callback, value.clone()));
            slot.value = Some(value);
            self.done.store(true, Ordering::Release);
            self.ready.notify_all();
            pending_callback
        };

        self.notify.notify_waiters();

        if let Some((callback, value)) = pending_callback {
            callback(value);
        }
        true
    }

    pub fn is_complete(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn get(&self) -> Option<T> {
        if !self.is_complete() {
            return None;
        }
        self.state.lock().value.clone()
    }

    /// Blocks the calling thread until a value is present.
    pub fn wait(&self) -> T {
        let mut slot = self.state.lock();
        loop {
            if let Some(value) = &slot.value {
                return value.clone();
            }
            self.ready.wait(&mut slot);
        }
    }

    /// Like `wait`, but gives up after `timeout` and returns `None`.
    pub fn wait_for(&self, timeout: Duration) -> Option<T> {
        let mut slot = self.state.lock();
        if let Some(value) = &slot.value {
            return Some(value.clone());
        }
        // Windows too large to represent as an instant never expire.
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            drop(slot);
            return Some(self.wait());
        };
        loop {
            if let Some(value) = &slot.value {
                return Some(value.clone());
            }
            if self.ready.wait_until(&mut slot, deadline).timed_out() {
                return slot.value.clone();
            }
        }
    }

    /// Suspends the current task until a value is present.
    pub async fn wait_async(&self) -> T {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.get() {
                return value;
            }
            notified.await;
        }
    }

    /// Runs `callback` once with the value: immediately if it is already
    /// present, otherwise from the thread that completes the cell.
    ///
    /// Returns `false` without running anything when a callback is already stored.
    pub fn on_complete<F>(&self, callback: F) -> bool
    where
        F: FnOnce(T) + Send + 'static,
    {
        if let Some(value) = self.get() {
            callback(value);
            return true;
        }

        let ready_value = {
            let mut slot = self.state.lock();
            // Completed between the fast-path check and taking the lock.
            if let Some(value) = slot.value.clone() {
                value
            } else if slot.callback.is_some() {
                return false;
            } else {
                slot.callback = Some(Box::new(callback));
                return true;
            }
        };

        callback(ready_value);
        true
    }
}

impl<T: Clone + Send + 'static> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_completes_only_once() {
        let cell = Completion::new();
        assert!(!cell.is_complete());
        assert!(cell.complete(1));
        assert!(!cell.complete(2));
        assert_eq!(cell.get(), Some(1));
        assert_eq!(cell.wait(), 1);
    }

    #[test]
    fn test_wait_for_times_out_when_empty() {
        let cell: Completion<u32> = Completion::new();
        let started = Instant::now();
        assert_eq!(cell.wait_for(Duration::from_millis(30)), None);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_wait_for_accepts_unbounded_window() {
        let cell = Arc::new(Completion::new());
        cell.complete(4u32);
        assert_eq!(cell.wait_for(Duration::MAX), Some(4));

        let pending = Arc::new(Completion::new());
        let reader = {
            let pending = pending.clone();
            thread::spawn(move || pending.wait_for(Duration::MAX))
        };
        thread::sleep(Duration::from_millis(20));
        pending.complete(8u32);
        assert_eq!(reader.join().unwrap(), Some(8));
    }

    #[test]
    fn test_blocked_reader_is_woken() {
        let cell = Arc::new(Completion::new());
        let reader = {
            let cell = cell.clone();
            thread::spawn(move || cell.wait())
        };

        thread::sleep(Duration::from_millis(20));
        assert!(cell.complete("done".to_string()));
        assert_eq!(reader.join().unwrap(), "done");
    }

    #[test]
    fn test_callback_before_completion_runs_once() {
        let cell = Completion::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();

        assert!(cell.on_complete(move |value: u32| {
            assert_eq!(value, 9);
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        cell.complete(9);
        cell.complete(10);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_after_completion_runs_immediately() {
        let cell = Completion::new();
        cell.complete(3u32);

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        assert!(cell.on_complete(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_second_pending_callback_is_rejected() {
        let cell: Completion<u32> = Completion::new();
        assert!(cell.on_complete(|_| {}));
        assert!(!cell.on_complete(|_| {}));
    }

    #[test]
    fn test_racing_writers_and_readers() {
        for _ in 0..200 {
            let cell = Arc::new(Completion::new());
            let wins = Arc::new(AtomicUsize::new(0));
            let callbacks = Arc::new(AtomicUsize::new(0));

            {
                let callbacks = callbacks.clone();
                cell.on_complete(move |_: usize| {
                    callbacks.fetch_add(1, Ordering::SeqCst);
                });
            }

            let readers: Vec<_> = (0..3)
                .map(|_| {
                    let cell = cell.clone();
                    thread::spawn(move || cell.wait())
                })
                .collect();

            let writers: Vec<_> = (0..3)
                .map(|writer| {
                    let cell = cell.clone();
                    let wins = wins.clone();
                    thread::spawn(move || {
                        if cell.complete(writer) {
                            wins.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();

            for writer in writers {
                writer.join().unwrap();
            }
            let winner = cell.get().unwrap();
            for reader in readers {
                assert_eq!(reader.join().unwrap(), winner);
            }
            assert_eq!(wins.load(Ordering::SeqCst), 1);
            assert_eq!(callbacks.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_async_reader_is_woken() {
        let cell = Arc::new(Completion::new());
        let writer = {
            let cell = cell.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                cell.complete(5u8);
            })
        };

        assert_eq!(cell.wait_async().await, 5);
        writer.await.unwrap();
    }
}
