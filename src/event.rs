//! Event handling system for LED sign status updates.
//!
//! This module provides the event infrastructure for notifying about
//! connection state changes, device list refreshes and user-facing
//! notices.

use std::{fmt, sync::Arc};

use smol_str::SmolStr;

use crate::bluetooth::{Device, Status};

/// Short user-visible notice about the outcome of an operation.
#[derive(Debug, Clone, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Notice {
   Connected(SmolStr),
   ConnectFailed(String),
   Disconnected,
   Sent,
   SendFailed,
   PermissionDenied,
}

impl Notice {
   /// Machine-readable notice kind.
   pub fn kind(&self) -> &'static str {
      self.into()
   }
}

impl fmt::Display for Notice {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Self::Connected(name) => write!(f, "Connected: {name}"),
         Self::ConnectFailed(reason) => write!(f, "Connect failed: {reason}"),
         Self::Disconnected => f.write_str("Disconnected"),
         Self::Sent => f.write_str("Sent"),
         Self::SendFailed => f.write_str("Send failed"),
         Self::PermissionDenied => f.write_str("Bluetooth permission request failed"),
      }
   }
}

/// Events that can be emitted by the LED sign service.
#[derive(Debug, Clone)]
pub enum SignEvent {
   StateChanged(Status),
   DevicesRefreshed(Vec<Device>),
   Notice(Notice),
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: SignEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
