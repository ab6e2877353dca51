//! BlueZ implementation of the platform Bluetooth operations.

use bluer::{Adapter, Session};
use log::{debug, info, warn};

use crate::{
   bluetooth::{
      BluetoothStack, Device,
      rfcomm::{self, LinkTimeouts, RfcommLink},
   },
   config::Config,
   error::{Result, SignError},
};

/// BlueZ session bound to one adapter.
pub struct BluezStack {
   session: Session,
   adapter: Adapter,
   channel: Option<u8>,
   timeouts: LinkTimeouts,
}

impl BluezStack {
   pub async fn new(config: &Config) -> Result<Self> {
      let session = Session::new().await?;
      let adapter = match config.adapter.as_deref() {
         Some(name) => session.adapter(name)?,
         None => session.default_adapter().await?,
      };
      info!("Using Bluetooth adapter: {}", adapter.name());

      Ok(Self {
         session,
         adapter,
         channel: config.rfcomm_channel,
         timeouts: LinkTimeouts {
            connect: config.connect_timeout(),
            write: config.write_timeout(),
         },
      })
   }

   pub fn adapter(&self) -> &Adapter {
      &self.adapter
   }
}

impl BluetoothStack for BluezStack {
   type Link = RfcommLink;

   async fn has_required_permissions(&self) -> bool {
      match self.adapter.is_powered().await {
         Ok(powered) => powered,
         Err(e) => {
            debug!("Adapter {} not accessible: {e}", self.adapter.name());
            false
         },
      }
   }

   async fn request_permissions(&self) -> Result<bool> {
      if self.adapter.is_powered().await? {
         return Ok(true);
      }

      match self.adapter.set_powered(true).await {
         Ok(()) => {
            info!("Powered on adapter: {}", self.adapter.name());
            Ok(true)
         },
         Err(e) => {
            let e = SignError::from(e);
            if e.is_access_denied() {
               warn!("Not allowed to power on {}: {e}", self.adapter.name());
               Ok(false)
            } else {
               Err(e)
            }
         },
      }
   }

   async fn bonded_devices(&self) -> Result<Vec<Device>> {
      let mut devices = Vec::new();
      for addr in self.adapter.device_addresses().await? {
         let device = self.adapter.device(addr)?;
         if !device.is_paired().await.unwrap_or(false) {
            continue;
         }
         let name = device.name().await.ok().flatten();
         devices.push(Device::new(addr, name));
      }
      debug!("{} bonded devices on {}", devices.len(), self.adapter.name());
      Ok(devices)
   }

   async fn open(&self, device: &Device) -> Result<RfcommLink> {
      rfcomm::connect(
         &self.session,
         &self.adapter,
         device.address,
         self.channel,
         self.timeouts,
      )
      .await
   }
}
