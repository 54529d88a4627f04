// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Pool of byte buffers shared with the hardware.
//!
//! Buffers are handed out as [`PooledBuffer`]s and go back to the pool when dropped, provided the
//! pool still exists. The pool can be given a byte budget, in which case allocations that would
//! exceed it fail with [`PoolError::Exhausted`] instead of growing without bounds.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use thiserror::Error;

/// Maximum number of released backing stores kept around for reuse.
const MAX_RECYCLED: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("zero sized allocation requested")]
    ZeroSize,
    #[error("buffer pool exhausted: requested {requested} bytes, {available} available")]
    Exhausted { requested: usize, available: usize },
    #[error("buffer pool lock poisoned")]
    Poisoned,
}

/// Unique identifier of a buffer allocated from a [`BufferPool`].
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(u64);

/// Allocation counters of a [`BufferPool`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of successful allocations.
    pub allocations: usize,
    /// Number of buffers returned to the pool.
    pub releases: usize,
    /// Bytes currently held by live buffers.
    pub bytes_in_use: usize,
}

impl PoolStats {
    /// Number of buffers currently alive.
    pub fn live_buffers(&self) -> usize {
        self.allocations - self.releases
    }
}

#[derive(Debug)]
struct PoolState {
    limit: Option<usize>,
    next_id: u64,
    stats: PoolStats,
    recycled: VecDeque<Vec<u8>>,
}

/// A buffer obtained from a [`BufferPool`].
///
/// The buffer is released back to its pool upon dropping.
pub struct PooledBuffer {
    id: BufferId,
    data: Vec<u8>,
    pool: Weak<Mutex<PoolState>>,
}

impl PooledBuffer {
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Size of the buffer in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Explicitly returns the buffer to its pool. Equivalent to dropping it.
    pub fn release(self) {}
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("id", &self.id)
            .field("size", &self.data.len())
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let Some(pool) = self.pool.upgrade() else {
            return;
        };

        let Ok(mut state) = pool.lock() else {
            log::error!("Buffer pool poisoned, leaking buffer id={:?}", self.id);
            return;
        };

        state.stats.releases += 1;
        state.stats.bytes_in_use -= self.data.len();
        log::trace!(
            "Released buffer id={:?} size={} live={}",
            self.id,
            self.data.len(),
            state.stats.live_buffers()
        );

        if state.recycled.len() < MAX_RECYCLED {
            state.recycled.push_back(std::mem::take(&mut self.data));
        }
    }
}

/// A pool of byte buffers, cheap to clone. All clones refer to the same pool.
#[derive(Clone, Debug)]
pub struct BufferPool {
    state: Arc<Mutex<PoolState>>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(None)
    }
}

impl BufferPool {
    /// Creates a pool. If `limit` is set, the bytes held by live buffers never exceed it.
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            state: Arc::new(Mutex::new(PoolState {
                limit,
                next_id: 0,
                stats: Default::default(),
                recycled: VecDeque::new(),
            })),
        }
    }

    /// Allocates a zero-filled buffer of `size` bytes.
    pub fn alloc(&self, size: usize) -> Result<PooledBuffer, PoolError> {
        if size == 0 {
            return Err(PoolError::ZeroSize);
        }

        let mut state = self.state.lock().map_err(|_| PoolError::Poisoned)?;

        if let Some(limit) = state.limit {
            let available = limit.saturating_sub(state.stats.bytes_in_use);
            if size > available {
                log::warn!("Buffer pool exhausted: requested={size} available={available}");
                return Err(PoolError::Exhausted {
                    requested: size,
                    available,
                });
            }
        }

        let mut data = match state.recycled.iter().position(|b| b.capacity() >= size) {
            Some(index) => state.recycled.remove(index).unwrap_or_default(),
            None => Vec::with_capacity(size),
        };
        data.clear();
        data.resize(size, 0);

        let id = BufferId(state.next_id);
        state.next_id += 1;
        state.stats.allocations += 1;
        state.stats.bytes_in_use += size;

        log::trace!("Allocated buffer id={id:?} size={size}");

        Ok(PooledBuffer {
            id,
            data,
            pool: Arc::downgrade(&self.state),
        })
    }

    /// Returns the pool's counters.
    pub fn stats(&self) -> PoolStats {
        match self.state.lock() {
            Ok(state) => state.stats,
            Err(poisoned) => poisoned.into_inner().stats,
        }
    }
}
