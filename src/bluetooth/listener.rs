//! System connection event listener.
//!
//! Watches the `Connected` property of every device BlueZ knows on the
//! adapter and forwards changes on bonded devices to the connection
//! manager. Devices appearing or disappearing on the adapter get their
//! watcher started or stopped.

use std::{collections::HashMap, pin::pin, sync::Arc};

use bluer::{Adapter, AdapterEvent, Address, DeviceEvent, DeviceProperty};
use futures::{Stream, StreamExt};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::{
   bluetooth::{Device, bluez::BluezStack, manager::ConnectionManager},
   error::Result,
};

type Watchers = Arc<Mutex<HashMap<Address, JoinHandle<()>>>>;

/// Running listener; stops all watchers when dropped.
pub struct ConnectionListener {
   monitor_handle: JoinHandle<()>,
   watchers: Watchers,
}

impl ConnectionListener {
   pub async fn start(adapter: Adapter, manager: ConnectionManager<BluezStack>) -> Result<Self> {
      let watchers: Watchers = Arc::default();

      for addr in adapter.device_addresses().await? {
         watch_device(&adapter, addr, &manager, &watchers).await;
      }
      info!(
         "Watching {} devices on {}",
         watchers.lock().len(),
         adapter.name()
      );

      let events = adapter.events().await?;
      let monitor_handle = tokio::spawn(monitor_adapter(
         adapter,
         events,
         manager,
         watchers.clone(),
      ));

      Ok(Self {
         monitor_handle,
         watchers,
      })
   }
}

impl Drop for ConnectionListener {
   fn drop(&mut self) {
      self.monitor_handle.abort();
      for (_, handle) in self.watchers.lock().drain() {
         handle.abort();
      }
   }
}

async fn monitor_adapter(
   adapter: Adapter,
   events: impl Stream<Item = AdapterEvent>,
   manager: ConnectionManager<BluezStack>,
   watchers: Watchers,
) {
   let mut events = pin!(events);
   while let Some(event) = events.next().await {
      match event {
         AdapterEvent::DeviceAdded(addr) => {
            let known = watchers.lock().contains_key(&addr);
            if !known {
               debug!("Device added on {}: {addr}", adapter.name());
               watch_device(&adapter, addr, &manager, &watchers).await;
            }
         },
         AdapterEvent::DeviceRemoved(addr) => {
            debug!("Device removed on {}: {addr}", adapter.name());
            if let Some(handle) = watchers.lock().remove(&addr) {
               handle.abort();
            }
         },
         _ => {},
      }
   }
   warn!("Adapter {} event stream ended", adapter.name());
}

async fn watch_device(
   adapter: &Adapter,
   addr: Address,
   manager: &ConnectionManager<BluezStack>,
   watchers: &Watchers,
) {
   let device = match adapter.device(addr) {
      Ok(device) => device,
      Err(e) => {
         warn!("Cannot watch {addr}: {e}");
         return;
      },
   };
   let events = match device.events().await {
      Ok(events) => events,
      Err(e) => {
         warn!("Failed to get events for {addr}: {e}");
         return;
      },
   };

   let manager = manager.clone();
   let handle = tokio::spawn(async move {
      let mut events = pin!(events);
      while let Some(event) = events.next().await {
         let DeviceEvent::PropertyChanged(DeviceProperty::Connected(connected)) = event else {
            continue;
         };
         if !device.is_paired().await.unwrap_or(false) {
            debug!("Ignoring link change of unpaired device {addr}");
            continue;
         }

         if connected {
            debug!("{addr}: link up");
            let name = device.name().await.ok().flatten();
            manager.on_system_connected(Device::new(addr, name)).await;
         } else {
            debug!("{addr}: link down");
            manager.on_system_disconnect(addr).await;
         }
      }
      debug!("{addr}: event stream ended");
   });

   if let Some(previous) = watchers.lock().insert(addr, handle) {
      previous.abort();
   }
}
