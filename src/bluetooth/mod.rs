//! Bluetooth communication layer for the LED sign.
//!
//! This module provides the RFCOMM link to the sign, the BlueZ access
//! gate, the connection manager and the system event listener. The
//! manager only talks to the platform through [`BluetoothStack`], which
//! BlueZ implements in [`bluez`].

use std::future::Future;

use bluer::Address;
use serde_json::json;
use smol_str::SmolStr;
use uuid::Uuid;

use crate::error::Result;

pub mod bluez;
pub mod listener;
pub mod manager;
pub mod permission;
pub mod rfcomm;

/// Serial Port Profile service class.
pub const SPP_UUID: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805F9B34FB);

/// A bonded Bluetooth device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
   pub address: Address,
   pub name: Option<SmolStr>,
}

impl Device {
   pub fn new(address: Address, name: Option<impl Into<SmolStr>>) -> Self {
      Self {
         address,
         name: name.map(Into::into),
      }
   }

   /// Name to show to the user: the device name, or its address.
   pub fn display_name(&self) -> SmolStr {
      match &self.name {
         Some(name) => name.clone(),
         None => SmolStr::new(self.address.to_string()),
      }
   }

   pub fn to_json(&self) -> serde_json::Value {
      json!({
          "address": self.address.to_string(),
          "name": self.name.as_deref(),
          "display_name": self.display_name().as_str(),
      })
   }
}

/// Connection state of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum LinkState {
   Disconnected,
   Connecting,
   Connected,
}

impl LinkState {
   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// Snapshot of the connection state and the device it refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
   pub state: LinkState,
   pub device: Option<Device>,
}

impl Status {
   pub const fn disconnected() -> Self {
      Self {
         state: LinkState::Disconnected,
         device: None,
      }
   }

   pub fn to_json(&self) -> serde_json::Value {
      json!({
          "state": self.state.to_str(),
          "device": self.device.as_ref().map(Device::to_json),
      })
   }
}

/// Open byte stream to a device.
pub trait SerialLink: Send + Sync + 'static {
   /// Writes a complete frame to the stream.
   fn write(&self, frame: &[u8]) -> impl Future<Output = Result<()>> + Send;

   /// Closes the stream; further writes fail.
   fn close(&self) -> impl Future<Output = Result<()>> + Send;

   /// Whether the stream is still usable.
   fn is_open(&self) -> bool;
}

/// Platform Bluetooth operations the connection manager depends on.
pub trait BluetoothStack: Send + Sync + 'static {
   type Link: SerialLink;

   /// Checks whether the platform grants access to the adapter.
   fn has_required_permissions(&self) -> impl Future<Output = bool> + Send;

   /// Asks the platform for adapter access. Returns whether it was granted.
   fn request_permissions(&self) -> impl Future<Output = Result<bool>> + Send;

   /// Lists the devices bonded with the adapter.
   fn bonded_devices(&self) -> impl Future<Output = Result<Vec<Device>>> + Send;

   /// Opens a serial stream to `device`.
   fn open(&self, device: &Device) -> impl Future<Output = Result<Self::Link>> + Send;
}
