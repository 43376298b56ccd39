use std::sync::{Condvar, Mutex, PoisonError};

/// Counting permit pool bounding simultaneous heavy build invocations.
///
/// Constructed once per run and passed by shared reference (`Arc`) into
/// every concurrent build task. The capacity is fixed for the pool's
/// lifetime. Release happens in [`Permit::drop`], so it cannot be skipped
/// on an early error return.
#[derive(Debug)]
pub struct Semaphore {
    capacity: usize,
    available: Mutex<usize>,
    cvar: Condvar,
}

impl Semaphore {
    pub fn new(capacity: usize) -> Self {
        Semaphore {
            capacity: capacity.max(1),
            available: Mutex::new(capacity.max(1)),
            cvar: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Blocks the calling task until a permit is free.
    pub fn acquire(&self) -> Permit<'_> {
        let mut available = self
            .available
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while *available == 0 {
            available = self
                .cvar
                .wait(available)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *available -= 1;
        Permit { sema: self }
    }

    fn release(&self) {
        let mut available = self
            .available
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *available += 1;
        self.cvar.notify_one();
    }
}

/// Scoped permit; the slot is returned to the pool on drop.
#[derive(Debug)]
pub struct Permit<'a> {
    sema: &'a Semaphore,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.sema.release();
    }
}
