// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address-space region allocator
//!
//! A pool holds disjoint free ranges keyed by base address. Handing out a
//! [`Region`] removes its range from the pool; dropping the region puts the
//! range back and merges it with free neighbours. A region that outlives its
//! pool simply vanishes.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::{Result, Status};

/// A `[base, base + size)` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionSpan {
    /// First address.
    pub base: u64,
    /// Length in bytes or ports.
    pub size: u64,
}

impl RegionSpan {
    /// One past the last address.
    pub fn end(&self) -> u64 {
        self.base + self.size
    }

    /// Returns `true` if the spans share any address.
    pub fn overlaps(&self, other: &RegionSpan) -> bool {
        self.base < other.end() && other.base < self.end()
    }
}

struct PoolShared {
    name: String,
    state: Mutex<PoolState>,
}

#[derive(Default)]
struct PoolState {
    free: BTreeMap<u64, u64>,
    allocated: BTreeMap<u64, u64>,
}

impl PoolState {
    fn overlaps(map: &BTreeMap<u64, u64>, base: u64, end: u64) -> bool {
        map.range(..end).next_back().is_some_and(|(&b, &s)| b + s > base)
    }

    fn insert_free(&mut self, mut base: u64, mut size: u64) {
        if let Some((&prev_base, &prev_size)) = self.free.range(..base).next_back() {
            if prev_base + prev_size == base {
                self.free.remove(&prev_base);
                base = prev_base;
                size += prev_size;
            }
        }
        if let Some(next_size) = self.free.remove(&(base + size)) {
            size += next_size;
        }
        self.free.insert(base, size);
    }

    fn carve(&mut self, free_base: u64, free_size: u64, base: u64, size: u64) {
        self.free.remove(&free_base);
        if base > free_base {
            self.free.insert(free_base, base - free_base);
        }
        let end = base + size;
        let free_end = free_base + free_size;
        if free_end > end {
            self.free.insert(end, free_end - end);
        }
        self.allocated.insert(base, size);
    }
}

/// A pool of address space. Clones share the pool.
#[derive(Clone)]
pub struct RegionAllocator {
    shared: Arc<PoolShared>,
}

/// An allocated range. Returns to its pool when dropped.
#[derive(Debug)]
pub struct Region {
    span: RegionSpan,
    pool: Weak<PoolShared>,
}

fn checked_span(base: u64, size: u64) -> Result<RegionSpan> {
    if size == 0 || base.checked_add(size).is_none() {
        return Err(Status::InvalidArgs);
    }
    Ok(RegionSpan { base, size })
}

impl RegionAllocator {
    /// Creates an empty pool. `name` is used in diagnostics.
    pub fn new(name: &str) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                name: name.to_string(),
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    /// Pool name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Adds `[base, base + size)` to the pool.
    ///
    /// Fails with `AlreadyExists` if the range overlaps anything the pool
    /// already manages, free or allocated.
    pub fn add_region(&self, base: u64, size: u64) -> Result<()> {
        let span = checked_span(base, size)?;
        let mut state = self.shared.state.lock();
        if PoolState::overlaps(&state.free, span.base, span.end())
            || PoolState::overlaps(&state.allocated, span.base, span.end())
        {
            return Err(Status::AlreadyExists);
        }
        state.insert_free(span.base, span.size);
        Ok(())
    }

    /// Takes the lowest free range of `size`.
    pub fn get_region(&self, size: u64) -> Result<Region> {
        if size == 0 {
            return Err(Status::InvalidArgs);
        }
        let mut state = self.shared.state.lock();
        let (free_base, free_size) = state
            .free
            .iter()
            .map(|(&b, &s)| (b, s))
            .find(|&(_, s)| s >= size)
            .ok_or(Status::NotFound)?;
        state.carve(free_base, free_size, free_base, size);
        Ok(self.region(free_base, size))
    }

    /// Takes exactly `[base, base + size)`. Fails with `NotFound` unless the
    /// whole range is free.
    pub fn get_region_exact(&self, base: u64, size: u64) -> Result<Region> {
        let span = checked_span(base, size)?;
        let mut state = self.shared.state.lock();
        let (free_base, free_size) = state
            .free
            .range(..=span.base)
            .next_back()
            .map(|(&b, &s)| (b, s))
            .filter(|&(b, s)| b + s >= span.end())
            .ok_or(Status::NotFound)?;
        state.carve(free_base, free_size, span.base, span.size);
        Ok(self.region(span.base, span.size))
    }

    /// Free ranges in address order.
    pub fn available_regions(&self) -> Vec<RegionSpan> {
        let state = self.shared.state.lock();
        state.free.iter().map(|(&base, &size)| RegionSpan { base, size }).collect()
    }

    /// Number of regions currently handed out.
    pub fn allocated_count(&self) -> usize {
        self.shared.state.lock().allocated.len()
    }

    fn region(&self, base: u64, size: u64) -> Region {
        Region { span: RegionSpan { base, size }, pool: Arc::downgrade(&self.shared) }
    }
}

impl core::fmt::Debug for RegionAllocator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RegionAllocator")
            .field("name", &self.shared.name)
            .field("available", &self.available_regions())
            .finish()
    }
}

impl Region {
    /// First address.
    pub fn base(&self) -> u64 {
        self.span.base
    }

    /// Length.
    pub fn size(&self) -> u64 {
        self.span.size
    }

    /// The covered span.
    pub fn span(&self) -> RegionSpan {
        self.span
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        let mut state = pool.state.lock();
        if state.allocated.remove(&self.span.base).is_some() {
            state.insert_free(self.span.base, self.span.size);
        }
    }
}
