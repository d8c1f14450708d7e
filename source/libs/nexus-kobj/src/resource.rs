// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Resource capabilities scoped to a physical address or I/O port range

use std::sync::Arc;

use crate::{Koid, Result, Status};

/// Longest object name kept; longer names are truncated.
pub const MAX_NAME_LEN: usize = 32;

/// Address space a resource grants access to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// The root resource from which all others are minted.
    Root,
    /// Memory-mapped I/O range.
    Mmio,
    /// x86 I/O port range.
    IoPort,
}

#[derive(Debug)]
struct ResourceInfo {
    koid: Koid,
    kind: ResourceKind,
    base: u64,
    size: u64,
    exclusive: bool,
    name: String,
}

/// Capability to a range of a given address space. Clones share the object.
#[derive(Debug, Clone)]
pub struct Resource {
    info: Arc<ResourceInfo>,
}

impl Resource {
    /// Creates the root resource.
    pub fn root() -> Self {
        Self {
            info: Arc::new(ResourceInfo {
                koid: Koid::next(),
                kind: ResourceKind::Root,
                base: 0,
                size: 0,
                exclusive: false,
                name: "root".to_string(),
            }),
        }
    }

    /// Mints a resource for `[base, base + size)` from the root resource `parent`.
    pub fn create(
        parent: &Resource,
        kind: ResourceKind,
        base: u64,
        size: u64,
        name: &str,
        exclusive: bool,
    ) -> Result<Self> {
        if parent.kind() != ResourceKind::Root {
            return Err(Status::NotSupported);
        }
        if kind == ResourceKind::Root || size == 0 {
            return Err(Status::InvalidArgs);
        }
        if base.checked_add(size).is_none() {
            return Err(Status::OutOfRange);
        }
        let name: String = name.chars().take(MAX_NAME_LEN - 1).collect();
        Ok(Self {
            info: Arc::new(ResourceInfo { koid: Koid::next(), kind, base, size, exclusive, name }),
        })
    }

    /// Object identifier.
    pub fn koid(&self) -> Koid {
        self.info.koid
    }

    /// Address space of the resource.
    pub fn kind(&self) -> ResourceKind {
        self.info.kind
    }

    /// First address covered.
    pub fn base(&self) -> u64 {
        self.info.base
    }

    /// Length of the covered range.
    pub fn size(&self) -> u64 {
        self.info.size
    }

    /// Whether the range was minted for exclusive use.
    pub fn is_exclusive(&self) -> bool {
        self.info.exclusive
    }

    /// Object name.
    pub fn name(&self) -> &str {
        &self.info.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_resource_covers_requested_range() {
        let root = Resource::root();
        let mmio = Resource::create(&root, ResourceKind::Mmio, 0x1000, 0x2000, "PCI Mmio32", true)
            .expect("mint mmio");
        assert_eq!(mmio.kind(), ResourceKind::Mmio);
        assert_eq!((mmio.base(), mmio.size()), (0x1000, 0x2000));
        assert!(mmio.is_exclusive());
        assert_eq!(mmio.name(), "PCI Mmio32");
    }

    #[test]
    fn only_root_can_mint() {
        let root = Resource::root();
        let io = Resource::create(&root, ResourceKind::IoPort, 0, 8, "io", false).unwrap();
        let err = Resource::create(&io, ResourceKind::IoPort, 0, 4, "io", false).unwrap_err();
        assert_eq!(err, Status::NotSupported);
    }

    #[test]
    fn rejects_empty_and_overflowing_ranges() {
        let root = Resource::root();
        assert_eq!(
            Resource::create(&root, ResourceKind::Mmio, 0, 0, "x", false).unwrap_err(),
            Status::InvalidArgs
        );
        assert_eq!(
            Resource::create(&root, ResourceKind::Mmio, u64::MAX, 2, "x", false).unwrap_err(),
            Status::OutOfRange
        );
    }

    #[test]
    fn long_names_are_truncated() {
        let root = Resource::root();
        let long = "x".repeat(80);
        let res = Resource::create(&root, ResourceKind::Mmio, 0, 1, &long, false).unwrap();
        assert_eq!(res.name().len(), MAX_NAME_LEN - 1);
    }
}
