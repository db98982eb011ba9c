//! Platform lock for Linux hosts
//!
//! The engine's locks are `embassy_sync` blocking mutexes generic over
//! [`RawMutex`]. A critical section would serialize every sensor on a host,
//! so this raw mutex sits on a `std::sync::Mutex` instead and sensors lock
//! independently. It is not reentrant.

use std::sync::{Mutex, PoisonError};

use embassy_sync::blocking_mutex::raw::RawMutex;

pub struct StdRawMutex {
    inner: Mutex<()>,
}

impl StdRawMutex {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(()),
        }
    }
}

impl Default for StdRawMutex {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl RawMutex for StdRawMutex {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();

    fn lock<R>(&self, f: impl FnOnce() -> R) -> R {
        // A panic inside `f` cannot leave the unit guarded value inconsistent
        let _guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
    use std::cell::RefCell;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_serializes_threads() {
        let counter = Arc::new(BlockingMutex::<StdRawMutex, RefCell<u64>>::new(RefCell::new(0)));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        counter.lock(|c| *c.borrow_mut() += 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.lock(|c| *c.borrow()), 40_000);
    }

    #[test]
    fn test_survives_poisoning() {
        let mutex = Arc::new(BlockingMutex::<StdRawMutex, RefCell<u32>>::new(RefCell::new(1)));
        let poisoner = mutex.clone();
        let _ = thread::spawn(move || {
            poisoner.lock(|value| {
                if *value.borrow() == 1 {
                    panic!("poison");
                }
            })
        })
        .join();
        assert_eq!(mutex.lock(|c| *c.borrow()), 1);
    }
}
