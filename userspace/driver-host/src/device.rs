// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Device records that work items are queued against

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{Result, Status};

bitflags::bitflags! {
    /// Device state and binding flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DeviceFlags: u32 {
        /// No driver may autobind to this device.
        const UNBINDABLE = 0x0000_0004;
        /// Device is not published to clients yet.
        const INVISIBLE = 0x0000_0200;
        /// Device may be a fragment of several composite devices.
        const ALLOW_MULTI_COMPOSITE = 0x0000_1000;
        /// Children must be bound in a separate host.
        const MUST_ISOLATE = 0x0000_2000;
    }
}

/// A node in the device tree, shared between the host and queued work.
#[derive(Debug)]
pub struct Device {
    name: String,
    protocol_id: u32,
    flags: Mutex<DeviceFlags>,
}

impl Device {
    /// Creates a device. The name must be non-empty.
    pub fn new(name: &str, protocol_id: u32, flags: DeviceFlags) -> Result<Arc<Device>> {
        if name.is_empty() {
            return Err(Status::InvalidArgs);
        }
        Ok(Arc::new(Device { name: name.to_string(), protocol_id, flags: Mutex::new(flags) }))
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Protocol the device implements.
    pub fn protocol_id(&self) -> u32 {
        self.protocol_id
    }

    /// Current flags.
    pub fn flags(&self) -> DeviceFlags {
        *self.flags.lock()
    }

    /// Sets `flags` in addition to the current ones.
    pub fn set_flags(&self, flags: DeviceFlags) {
        self.flags.lock().insert(flags);
    }

    /// Clears `flags`.
    pub fn clear_flags(&self, flags: DeviceFlags) {
        self.flags.lock().remove(flags);
    }

    /// Publishes the device by clearing [`DeviceFlags::INVISIBLE`].
    pub fn make_visible(&self) {
        self.clear_flags(DeviceFlags::INVISIBLE);
    }

    /// Returns `false` while the device is invisible.
    pub fn is_visible(&self) -> bool {
        !self.flags().contains(DeviceFlags::INVISIBLE)
    }
}
