// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Objects that can travel inside a channel message

use nexus_kobj::{Event, EventPair, Koid, Waitable};

use crate::Channel;

/// An owned object transferred through a channel.
#[derive(Debug)]
pub enum Handle {
    /// A channel endpoint.
    Channel(Channel),
    /// An event.
    Event(Event),
    /// One side of an event pair.
    EventPair(EventPair),
}

impl Handle {
    /// Object identifier of the carried object.
    pub fn koid(&self) -> Koid {
        match self {
            Handle::Channel(channel) => channel.koid(),
            Handle::Event(event) => event.koid(),
            Handle::EventPair(pair) => pair.koid(),
        }
    }

    /// Returns the channel if this handle carries one.
    pub fn into_channel(self) -> Option<Channel> {
        match self {
            Handle::Channel(channel) => Some(channel),
            _ => None,
        }
    }

    /// Returns the event if this handle carries one.
    pub fn into_event(self) -> Option<Event> {
        match self {
            Handle::Event(event) => Some(event),
            _ => None,
        }
    }

    /// Returns the event pair side if this handle carries one.
    pub fn into_event_pair(self) -> Option<EventPair> {
        match self {
            Handle::EventPair(pair) => Some(pair),
            _ => None,
        }
    }
}

impl From<Channel> for Handle {
    fn from(channel: Channel) -> Self {
        Handle::Channel(channel)
    }
}

impl From<Event> for Handle {
    fn from(event: Event) -> Self {
        Handle::Event(event)
    }
}

impl From<EventPair> for Handle {
    fn from(pair: EventPair) -> Self {
        Handle::EventPair(pair)
    }
}
