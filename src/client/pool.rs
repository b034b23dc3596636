//! Fixed-capacity pool of SFTP sub-sessions.
//!
//! Sub-sessions are created lazily, up to `capacity`, the first time a
//! borrower finds the pool empty. A borrower that finds every sub-session in
//! use blocks until one is returned. There is no timeout: under heavy
//! contention borrowers queue indefinitely.
//!
//! Returning is tied to the `Pooled` guard's `Drop`, so every exit path,
//! including `?` and panics, puts the sub-session back.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::error::SshfsError;

struct PoolInner<T> {
    idle: VecDeque<T>,
    /// Sub-sessions alive, idle or borrowed, plus ones being created.
    created: usize,
    closed: bool,
}

pub struct SessionPool<T> {
    capacity: usize,
    host: String,
    port: u16,
    inner: Mutex<PoolInner<T>>,
    returned: Condvar,
}

impl<T> SessionPool<T> {
    pub fn new(capacity: usize, host: impl Into<String>, port: u16) -> Self {
        Self {
            capacity: capacity.max(1),
            host: host.into(),
            port,
            inner: Mutex::new(PoolInner {
                idle: VecDeque::new(),
                created: 0,
                closed: false,
            }),
            returned: Condvar::new(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, PoolInner<T>>, SshfsError> {
        self.inner.lock().map_err(|_| SshfsError::Io {
            source: std::io::Error::new(
                std::io::ErrorKind::Other,
                "session pool mutex was poisoned; a previous operation panicked",
            ),
        })
    }

    fn closed_error(&self) -> SshfsError {
        SshfsError::NotConnected {
            host: self.host.clone(),
            port: self.port,
        }
    }

    /// Borrow a sub-session, creating one with `init` if the pool has room.
    ///
    /// `init` runs without the pool lock held.
    pub fn borrow_with<F>(&self, init: F) -> Result<Pooled<'_, T>, SshfsError>
    where
        F: FnOnce() -> Result<T, SshfsError>,
    {
        let mut inner = self.lock()?;
        loop {
            if inner.closed {
                return Err(self.closed_error());
            }
            if let Some(item) = inner.idle.pop_front() {
                tracing::trace!(idle = inner.idle.len(), "Borrowed pooled sub-session");
                return Ok(Pooled {
                    pool: self,
                    item: Some(item),
                });
            }
            if inner.created < self.capacity {
                inner.created += 1;
                break;
            }
            tracing::trace!(capacity = self.capacity, "Pool exhausted, waiting for a return");
            inner = self
                .returned
                .wait(inner)
                .map_err(|_| SshfsError::Io {
                    source: std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "session pool mutex was poisoned while waiting",
                    ),
                })?;
        }
        drop(inner);

        match init() {
            Ok(item) => {
                tracing::debug!(host = %self.host, capacity = self.capacity, "Created pooled sub-session");
                Ok(Pooled {
                    pool: self,
                    item: Some(item),
                })
            }
            Err(e) => {
                self.forget_one();
                Err(e)
            }
        }
    }

    /// Release a reservation whose sub-session was never created or was
    /// dropped, so another borrower may create a replacement.
    fn forget_one(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.created = inner.created.saturating_sub(1);
        drop(inner);
        self.returned.notify_one();
    }

    fn give_back(&self, item: T) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.closed {
            inner.created = inner.created.saturating_sub(1);
            drop(inner);
            drop(item);
            return;
        }
        inner.idle.push_back(item);
        drop(inner);
        self.returned.notify_one();
    }

    /// Drop every idle sub-session and refuse further borrows.
    ///
    /// Borrowed sub-sessions are dropped when their guards are.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.closed = true;
        let idle = std::mem::take(&mut inner.idle);
        inner.created = inner.created.saturating_sub(idle.len());
        drop(inner);
        drop(idle);
        self.returned.notify_all();
    }

    pub fn idle_count(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.idle.len())
            .unwrap_or(0)
    }

    pub fn created_count(&self) -> usize {
        self.inner.lock().map(|inner| inner.created).unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().map(|inner| inner.closed).unwrap_or(true)
    }
}

/// A borrowed sub-session. Returned to the pool on drop.
pub struct Pooled<'a, T> {
    pool: &'a SessionPool<T>,
    item: Option<T>,
}

impl<T> Deref for Pooled<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.item {
            Some(item) => item,
            None => unreachable!("pooled item is only taken in drop"),
        }
    }
}

impl<T> DerefMut for Pooled<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.item {
            Some(item) => item,
            None => unreachable!("pooled item is only taken in drop"),
        }
    }
}

impl<T> Drop for Pooled<'_, T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.give_back(item);
        }
    }
}
