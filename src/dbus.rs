use std::str::FromStr;

use bluer::Address;
use log::info;
use zbus::{interface, object_server::SignalEmitter};

use crate::{
   bluetooth::{Device, bluez::BluezStack, manager::ConnectionManager},
   error::SignError,
   sign::frame::Direction,
};

pub struct SignService {
   manager: ConnectionManager<BluezStack>,
   default_direction: Direction,
}

impl SignService {
   pub const fn new(manager: ConnectionManager<BluezStack>, default_direction: Direction) -> Self {
      Self {
         manager,
         default_direction,
      }
   }
}

fn failed(e: impl ToString) -> zbus::fdo::Error {
   zbus::fdo::Error::Failed(e.to_string())
}

pub fn devices_json(devices: &[Device]) -> String {
   let devices: Vec<serde_json::Value> = devices.iter().map(Device::to_json).collect();
   serde_json::Value::from(devices).to_string()
}

#[interface(name = "org.ledsign.Manager")]
impl SignService {
   async fn get_devices(&self) -> String {
      devices_json(&self.manager.devices().await)
   }

   async fn refresh_devices(&self) -> zbus::fdo::Result<String> {
      let devices = self.manager.refresh_devices().await.map_err(failed)?;
      Ok(devices_json(&devices))
   }

   async fn get_status(&self) -> String {
      self.manager.status().await.to_json().to_string()
   }

   async fn request_permissions(&self) -> bool {
      self.manager.request_permissions().await.is_ok()
   }

   async fn connect(&self, address: String) -> zbus::fdo::Result<bool> {
      let addr =
         Address::from_str(&address).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;

      let device = self
         .manager
         .devices()
         .await
         .into_iter()
         .find(|d| d.address == addr)
         .ok_or(SignError::DeviceNotFound(addr))
         .map_err(failed)?;

      self.manager.connect(device).await.map_err(failed)?;
      Ok(true)
   }

   async fn disconnect(&self) -> zbus::fdo::Result<bool> {
      self.manager.disconnect().await.map_err(failed)?;
      Ok(true)
   }

   async fn send(&self, payload: String) -> zbus::fdo::Result<bool> {
      self.manager.send(payload).await.map_err(failed)?;
      Ok(true)
   }

   async fn send_text(&self, direction: String, text: String) -> zbus::fdo::Result<bool> {
      let direction = Direction::parse_or(&direction, self.default_direction)
         .map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;

      let sent = self
         .manager
         .send_text(direction, &text)
         .await
         .map_err(failed)?;
      if sent {
         info!("Sent {} chars scrolling {direction:?}", text.chars().count());
      }
      Ok(sent)
   }

   // Signals
   #[zbus(signal)]
   pub async fn state_changed(emitter: &SignalEmitter<'_>, status: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn devices_changed(emitter: &SignalEmitter<'_>, devices: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn notice(emitter: &SignalEmitter<'_>, kind: &str, message: &str)
   -> zbus::Result<()>;

   // Properties for polling-free updates
   #[zbus(property)]
   async fn connection_state(&self) -> String {
      self.manager.status().await.state.to_str().to_owned()
   }

   #[zbus(property)]
   async fn device_list(&self) -> String {
      self.get_devices().await
   }
}
