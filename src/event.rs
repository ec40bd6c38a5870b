//! Event handling for connection lifecycle updates.
//!
//! The connection manager publishes every state transition here so the
//! D-Bus layer can update status consumers without participating in the
//! state machine itself.

use std::sync::Arc;

use bluer::Address;

use crate::bluetooth::manager::ConnectionState;

/// Events emitted by the connection manager.
#[derive(Debug, Clone, Copy)]
pub enum HidEvent {
   StateChanged(ConnectionState),
   HostConnected(Address),
   HostDisconnected(Address),
   RadioUnavailable,
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: HidEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
