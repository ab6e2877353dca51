//! Error types for the LED sign service.
//!
//! This module defines all error types that can occur while talking to
//! BlueZ, the D-Bus session bus, the RFCOMM link and the configuration
//! file.

use bluer::Address;
use thiserror::Error;

/// Main error type for the LED sign service.
#[derive(Error, Debug)]
pub enum SignError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Bluetooth permission denied")]
   PermissionDenied,

   #[error("Device not found: {0}")]
   DeviceNotFound(Address),

   #[error("Not connected")]
   NotConnected,

   #[error("Already connected to {0}")]
   AlreadyConnected(Address),

   #[error("Already connecting to device")]
   AlreadyConnecting,

   #[error("Connect failed: {0}")]
   ConnectFailed(String),

   #[error("Send failed: {0}")]
   SendFailed(String),

   #[error("Invalid direction: {0}")]
   InvalidDirection(String),

   #[error("Connection closed")]
   ConnectionClosed,

   #[error("Request timeout")]
   RequestTimeout,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Manager has been shut down")]
   ManagerShutdown,
}

impl SignError {
   /// Returns true when BlueZ refused the operation on access grounds.
   pub fn is_access_denied(&self) -> bool {
      match self {
         Self::PermissionDenied => true,
         Self::Bluetooth(e) => matches!(
            e.kind,
            bluer::ErrorKind::NotAuthorized | bluer::ErrorKind::NotPermitted
         ),
         Self::Io(e) => e.kind() == std::io::ErrorKind::PermissionDenied,
         _ => false,
      }
   }
}

/// Convenience type alias for Results with `SignError`.
pub type Result<T> = std::result::Result<T, SignError>;
