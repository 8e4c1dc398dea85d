//! Leaky bucket: a bounded fluid counter with blocking produce/consume.
//!
//! `content` always reads in `0..=capacity` between calls. A producer that
//! would overflow saturates the bucket, wakes consumers, and waits for room
//! with the remainder; a consumer that would underflow drains what is there,
//! wakes producers, and waits for the rest.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::config::types::{EvalError, Result};

pub struct LeakyBucket {
    capacity: i64,
    content: Mutex<i64>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl LeakyBucket {
    /// `initial` is clamped into `0..=capacity`.
    pub fn new(capacity: i64, initial: i64) -> Result<Self> {
        if capacity <= 0 {
            return Err(EvalError::Config(format!(
                "bucket capacity must be positive, got {}",
                capacity
            )));
        }
        Ok(Self {
            capacity,
            content: Mutex::new(initial.clamp(0, capacity)),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, i64> {
        self.content.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add `amount` credit, blocking while the bucket is full.
    pub fn produce(&self, amount: i64) -> Result<()> {
        if amount < 0 {
            return Err(EvalError::InvalidAmount(amount));
        }
        let mut amount = amount;
        let mut content = self.lock();
        while self.capacity < *content + amount {
            if *content <= 0 {
                self.not_empty.notify_all();
            }
            amount -= self.capacity - *content;
            *content = self.capacity;
            content = self
                .not_full
                .wait(content)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if *content <= 0 {
            self.not_empty.notify_all();
        }
        *content += amount;
        Ok(())
    }

    /// Take `amount` credit, blocking while the bucket is short.
    pub fn consume(&self, amount: i64) -> Result<()> {
        if amount < 0 {
            return Err(EvalError::InvalidAmount(amount));
        }
        let mut amount = amount;
        let mut content = self.lock();
        while *content - amount < 0 {
            if self.capacity <= *content {
                self.not_full.notify_all();
            }
            amount -= *content;
            *content = 0;
            content = self
                .not_empty
                .wait(content)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if self.capacity <= *content {
            self.not_full.notify_all();
        }
        *content -= amount;
        Ok(())
    }

    /// Take whatever is currently in the bucket without blocking.
    pub fn drain(&self) -> i64 {
        let mut content = self.lock();
        let taken = *content;
        if self.capacity <= *content {
            self.not_full.notify_all();
        }
        *content = 0;
        taken
    }

    pub fn content(&self) -> i64 {
        *self.lock()
    }

    pub fn capacity(&self) -> i64 {
        self.capacity
    }
}
