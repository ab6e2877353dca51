//! LED sign D-Bus Service
//!
//! This service pairs with a Bluetooth serial LED sign, keeps a single
//! connection to it and exposes a D-Bus interface for listing bonded
//! devices, connecting and sending scrolling text.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use bluetooth::{
   bluez::BluezStack, listener::ConnectionListener, manager::ConnectionManager,
   permission::PermissionGate,
};
use dbus::SignService;
use event::{EventBus, SignEvent};

mod bluetooth;
mod config;
mod dbus;
mod error;
mod event;
mod sign;

use crate::{dbus::SignServiceSignals, error::Result};

const BUS_NAME: &str = "org.ledsign";
const OBJECT_PATH: &str = "/org/ledsign/manager";

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting LED sign D-Bus service...");

   // Load configuration
   let config = config::Config::load()?;
   info!(
      "Loaded configuration, default direction {:?}",
      config.default_direction
   );

   // Create event channel
   let event_bus = EventProcessor::new();

   // Bring up the adapter and the connection manager
   let stack = Arc::new(BluezStack::new(&config).await?);
   let adapter = stack.adapter().clone();
   let gate = Arc::new(PermissionGate::new());
   let manager = ConnectionManager::new(
      stack,
      gate,
      event_bus.clone(),
      config.health_check_interval(),
   );

   if let Err(e) = manager.request_permissions().await {
      warn!("Bluetooth access not available at startup: {e}");
   }

   let _listener = ConnectionListener::start(adapter, manager.clone()).await?;

   // Create D-Bus service
   let service = SignService::new(manager.clone(), config.default_direction);

   // Build D-Bus connection
   let connection = connection::Builder::session()?
      .name(BUS_NAME)?
      .serve_at(OBJECT_PATH, service)?
      .build()
      .await?;

   info!("LED sign D-Bus service started at {BUS_NAME}");

   // Start event processor
   event_bus.spawn_dispatcher(connection).await?;

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down LED sign service...");
   manager.disconnect().await?;

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<SignEvent>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<SignEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(&self, iface: &InterfaceRef<SignService>, event: SignEvent) -> Result<()> {
      match event {
         SignEvent::StateChanged(status) => {
            iface
               .state_changed(&status.to_json().to_string())
               .await?;
         },
         SignEvent::DevicesRefreshed(devices) => {
            iface.devices_changed(&dbus::devices_json(&devices)).await?;
         },
         SignEvent::Notice(notice) => {
            iface.notice(notice.kind(), &notice.to_string()).await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, SignService>(OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: SignEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}
