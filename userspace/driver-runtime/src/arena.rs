// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Message arenas
//!
//! An arena owns every payload block allocated from it. Blocks are immutable
//! once allocated and are shared by reference count, so handing a payload
//! from writer to reader never copies it. Each block remembers the arena it
//! came from so a channel can reject payloads paired with the wrong arena.

use core::ops::Deref;
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Bulk payload storage shared by clone.
#[derive(Clone)]
pub struct Arena {
    inner: Arc<ArenaInner>,
}

struct ArenaInner {
    id: u64,
    tag: String,
    blocks: Mutex<Vec<Arc<[u8]>>>,
}

/// Immutable payload block owned by an [`Arena`].
#[derive(Clone)]
pub struct ArenaBytes {
    arena_id: u64,
    block: Arc<[u8]>,
}

impl Arena {
    /// Creates an empty arena. `tag` is used in diagnostics only.
    pub fn create(tag: &str) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self {
            inner: Arc::new(ArenaInner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                tag: tag.to_string(),
                blocks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Diagnostic tag.
    pub fn tag(&self) -> &str {
        &self.inner.tag
    }

    /// Allocates a block holding a copy of `bytes`.
    pub fn alloc_copy(&self, bytes: &[u8]) -> ArenaBytes {
        self.adopt(Arc::from(bytes))
    }

    /// Allocates a zeroed block of `len` bytes and lets `fill` initialize it.
    pub fn alloc_with(&self, len: usize, fill: impl FnOnce(&mut [u8])) -> ArenaBytes {
        let mut buf = vec![0u8; len];
        fill(&mut buf);
        self.adopt(Arc::from(buf))
    }

    fn adopt(&self, block: Arc<[u8]>) -> ArenaBytes {
        self.inner.blocks.lock().push(Arc::clone(&block));
        ArenaBytes { arena_id: self.inner.id, block }
    }

    /// Returns `true` if `bytes` was allocated from this arena.
    pub fn contains(&self, bytes: &ArenaBytes) -> bool {
        bytes.arena_id == self.inner.id
    }

    /// Total bytes handed out by this arena.
    pub fn allocated_bytes(&self) -> usize {
        self.inner.blocks.lock().iter().map(|b| b.len()).sum()
    }

    /// Returns `true` if both values refer to the same arena.
    pub fn ptr_eq(&self, other: &Arena) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl core::fmt::Debug for Arena {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Arena").field("id", &self.inner.id).field("tag", &self.inner.tag).finish()
    }
}

impl Deref for ArenaBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.block
    }
}

impl AsRef<[u8]> for ArenaBytes {
    fn as_ref(&self) -> &[u8] {
        &self.block
    }
}

impl core::fmt::Debug for ArenaBytes {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ArenaBytes").field("arena", &self.arena_id).field("len", &self.block.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_remember_their_arena() {
        let a = Arena::create("a");
        let b = Arena::create("b");
        let bytes = a.alloc_copy(&[1, 2, 3]);
        assert!(a.contains(&bytes));
        assert!(!b.contains(&bytes));
        assert_eq!(&*bytes, &[1, 2, 3]);
    }

    #[test]
    fn alloc_with_fills_block() {
        let arena = Arena::create("fill");
        let bytes = arena.alloc_with(4, |buf| buf.copy_from_slice(&[9, 8, 7, 6]));
        assert_eq!(bytes.as_ref(), &[9, 8, 7, 6]);
        assert_eq!(arena.allocated_bytes(), 4);
    }

    #[test]
    fn clones_share_storage() {
        let arena = Arena::create("shared");
        let clone = arena.clone();
        let bytes = clone.alloc_copy(b"xy");
        assert!(arena.contains(&bytes));
        assert!(arena.ptr_eq(&clone));
        assert_eq!(clone.tag(), "shared");
        assert_eq!(arena.allocated_bytes(), 2);
    }
}
