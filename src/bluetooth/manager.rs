//! Connection manager for the LED sign.
//!
//! This module owns the single session with a sign: it opens the serial
//! link, frames and writes commands, and tears the session down on user
//! request, write failure, link loss or a system disconnect event. All
//! state lives in one actor task so that user intents and system events
//! are applied one at a time.

use std::{mem, sync::Arc, time::Duration};

use bluer::Address;
use log::{debug, info, warn};
use tokio::{
   select,
   sync::{mpsc, oneshot},
   time::{self, MissedTickBehavior},
};

use crate::{
   bluetooth::{BluetoothStack, Device, LinkState, SerialLink, Status, permission::PermissionGate},
   error::{Result, SignError},
   event::{EventSender, Notice, SignEvent},
   sign::frame::{self, Direction},
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 64;

// === Session ===

/// The device the service is connected to, and its stream when one is open.
///
/// A session created from a system connect event has no stream until the
/// user connects explicitly.
struct Session<L> {
   device: Device,
   link: Option<L>,
}

enum Phase<L> {
   Idle,
   Connecting { attempt: u64, device: Device },
   Active(Session<L>),
}

// === Commands ===

enum ManagerCommand<L> {
   // System events
   SystemConnected(Device),
   SystemDisconnected(Address),

   // Connect task completion
   ConnectFinished {
      attempt: u64,
      device: Device,
      result: Result<L>,
      reply: oneshot::Sender<Result<()>>,
   },

   // User commands
   RequestPermissions(oneshot::Sender<Result<()>>),
   RefreshDevices(oneshot::Sender<Result<Vec<Device>>>),
   Connect(Device, oneshot::Sender<Result<()>>),
   Send(String, oneshot::Sender<Result<()>>),
   Disconnect(oneshot::Sender<()>),
   GetStatus(oneshot::Sender<Status>),
   GetDevices(oneshot::Sender<Vec<Device>>),
}

// === Handle ===

/// Handle to the connection manager actor.
///
/// This type is cheaply cloneable.
pub struct ConnectionManager<S: BluetoothStack> {
   inbox: mpsc::Sender<ManagerCommand<S::Link>>,
}

impl<S: BluetoothStack> Clone for ConnectionManager<S> {
   fn clone(&self) -> Self {
      Self {
         inbox: self.inbox.clone(),
      }
   }
}

impl<S: BluetoothStack> ConnectionManager<S> {
   pub fn new(
      stack: Arc<S>,
      gate: Arc<PermissionGate>,
      event_tx: EventSender,
      health_check_interval: Duration,
   ) -> Self {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      tokio::spawn(
         ManagerActor::new(stack, gate, event_tx, command_rx, health_check_interval).run(),
      );
      Self { inbox: command_tx }
   }

   async fn request<T>(
      &self,
      cmd: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand<S::Link>,
   ) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(cmd(tx))
         .await
         .map_err(|_| SignError::ManagerShutdown)?;
      rx.await.map_err(|_| SignError::ManagerShutdown)
   }

   /// Checks adapter access, requesting it when missing, and refreshes the
   /// device list once granted.
   pub async fn request_permissions(&self) -> Result<()> {
      self.request(ManagerCommand::RequestPermissions).await?
   }

   /// Re-reads the bonded devices from the adapter.
   pub async fn refresh_devices(&self) -> Result<Vec<Device>> {
      self.request(ManagerCommand::RefreshDevices).await?
   }

   /// Returns the last device list snapshot.
   pub async fn devices(&self) -> Vec<Device> {
      self
         .request(ManagerCommand::GetDevices)
         .await
         .unwrap_or_default()
   }

   pub async fn status(&self) -> Status {
      self
         .request(ManagerCommand::GetStatus)
         .await
         .unwrap_or_else(|_| Status::disconnected())
   }

   /// Opens a serial link to `device`. Resolves once the attempt finished.
   pub async fn connect(&self, device: Device) -> Result<()> {
      self
         .request(|tx| ManagerCommand::Connect(device, tx))
         .await?
   }

   /// Frames `payload` and writes it to the sign.
   pub async fn send(&self, payload: impl Into<String>) -> Result<()> {
      let payload = payload.into();
      self
         .request(|tx| ManagerCommand::Send(payload, tx))
         .await?
   }

   /// Sends a scroll command. Empty text is not sent and yields `Ok(false)`.
   pub async fn send_text(&self, direction: Direction, text: &str) -> Result<bool> {
      let Some(payload) = frame::compose(direction, text) else {
         debug!("Ignoring empty text");
         return Ok(false);
      };
      self.send(payload).await?;
      Ok(true)
   }

   /// Closes the session. Safe to call when already disconnected.
   pub async fn disconnect(&self) -> Result<()> {
      self.request(ManagerCommand::Disconnect).await
   }

   /// Reports a link-layer connection to `device` seen by the system.
   pub async fn on_system_connected(&self, device: Device) {
      if self
         .inbox
         .send(ManagerCommand::SystemConnected(device))
         .await
         .is_err()
      {
         warn!("Manager gone, dropping connect event");
      }
   }

   /// Reports a link-layer disconnection of `address` seen by the system.
   pub async fn on_system_disconnect(&self, address: Address) {
      if self
         .inbox
         .send(ManagerCommand::SystemDisconnected(address))
         .await
         .is_err()
      {
         warn!("Manager gone, dropping disconnect event");
      }
   }
}

// === Manager Actor ===

struct ManagerActor<S: BluetoothStack> {
   stack: Arc<S>,
   gate: Arc<PermissionGate>,
   event_tx: EventSender,
   command_rx: mpsc::Receiver<ManagerCommand<S::Link>>,
   loopback_rx: mpsc::Receiver<ManagerCommand<S::Link>>,
   loopback_tx: mpsc::Sender<ManagerCommand<S::Link>>,
   health_check_interval: Duration,

   // State
   devices: Vec<Device>,
   phase: Phase<S::Link>,
   next_attempt: u64,
}

impl<S: BluetoothStack> ManagerActor<S> {
   fn new(
      stack: Arc<S>,
      gate: Arc<PermissionGate>,
      event_tx: EventSender,
      command_rx: mpsc::Receiver<ManagerCommand<S::Link>>,
      health_check_interval: Duration,
   ) -> Self {
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      Self {
         stack,
         gate,
         event_tx,
         command_rx,
         loopback_rx,
         loopback_tx,
         health_check_interval,
         devices: Vec::new(),
         phase: Phase::Idle,
         next_attempt: 0,
      }
   }

   async fn run(mut self) {
      info!("Connection manager starting up");

      let mut health_check = time::interval(self.health_check_interval);
      health_check.set_missed_tick_behavior(MissedTickBehavior::Skip);

      loop {
         select! {
             _ = health_check.tick() => {
                 self.check_link_health().await;
             }
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("Connection manager shutting down");
                     break;
                 };
                 self.handle_command(cmd).await;
             }
             Some(cmd) = self.loopback_rx.recv() => {
                 self.handle_command(cmd).await;
             }
         }
      }

      self.teardown().await;
   }

   async fn handle_command(&mut self, cmd: ManagerCommand<S::Link>) {
      match cmd {
         ManagerCommand::SystemConnected(device) => {
            self.handle_system_connected(device);
         },
         ManagerCommand::SystemDisconnected(addr) => {
            self.handle_system_disconnected(addr).await;
         },
         ManagerCommand::ConnectFinished {
            attempt,
            device,
            result,
            reply,
         } => {
            let result = self.handle_connect_finished(attempt, device, result).await;
            let _ = reply.send(result);
         },
         ManagerCommand::RequestPermissions(reply) => {
            let result = self.request_permissions().await;
            let _ = reply.send(result);
         },
         ManagerCommand::RefreshDevices(reply) => {
            let result = self.refresh_devices().await;
            let _ = reply.send(result);
         },
         ManagerCommand::Connect(device, reply) => {
            // Replies once the spawned attempt reports back
            self.start_connect(device, reply).await;
         },
         ManagerCommand::Send(payload, reply) => {
            let result = self.send(&payload).await;
            let _ = reply.send(result);
         },
         ManagerCommand::Disconnect(reply) => {
            self.disconnect().await;
            let _ = reply.send(());
         },
         ManagerCommand::GetStatus(reply) => {
            let _ = reply.send(self.status());
         },
         ManagerCommand::GetDevices(reply) => {
            let _ = reply.send(self.devices.clone());
         },
      }
   }

   fn status(&self) -> Status {
      match &self.phase {
         Phase::Idle => Status::disconnected(),
         Phase::Connecting { .. } => Status {
            state: LinkState::Connecting,
            device: None,
         },
         Phase::Active(session) => Status {
            state: LinkState::Connected,
            device: Some(session.device.clone()),
         },
      }
   }

   fn emit_state(&self) {
      self.event_tx.emit(SignEvent::StateChanged(self.status()));
   }

   fn notice(&self, notice: Notice) {
      debug!("Notice: {notice}");
      self.event_tx.emit(SignEvent::Notice(notice));
   }

   fn require_permission(&self) -> Result<()> {
      self.gate.ensure().inspect_err(|_| self.notice(Notice::PermissionDenied))
   }

   async fn request_permissions(&mut self) -> Result<()> {
      if let Err(e) = self.gate.acquire(&*self.stack).await {
         self.notice(Notice::PermissionDenied);
         return Err(e);
      }
      self.refresh_devices().await.map(|_| ())
   }

   async fn refresh_devices(&mut self) -> Result<Vec<Device>> {
      self.require_permission()?;

      let devices = self.stack.bonded_devices().await.inspect_err(|e| {
         warn!("Failed to list bonded devices: {e}");
      })?;
      info!("Found {} bonded devices", devices.len());

      self.devices = devices.clone();
      self
         .event_tx
         .emit(SignEvent::DevicesRefreshed(devices.clone()));
      Ok(devices)
   }

   async fn start_connect(&mut self, device: Device, reply: oneshot::Sender<Result<()>>) {
      let rejection = if let Err(e) = self.require_permission() {
         Some(e)
      } else {
         match &self.phase {
            Phase::Connecting { .. } => Some(SignError::AlreadyConnecting),
            Phase::Active(Session {
               device: current,
               link: Some(link),
            }) if link.is_open() => Some(SignError::AlreadyConnected(current.address)),
            _ => None,
         }
      };
      if let Some(e) = rejection {
         debug!("Connect to {} rejected: {e}", device.address);
         let _ = reply.send(Err(e));
         return;
      }

      // A link-less or dead session is replaced by the new attempt
      if let Phase::Active(session) = mem::replace(&mut self.phase, Phase::Idle) {
         debug!("Replacing session with {}", session.device.address);
         close_link(session.link).await;
      }

      let attempt = self.next_attempt;
      self.next_attempt += 1;
      info!(
         "Connecting to {} ({})",
         device.display_name(),
         device.address
      );
      self.phase = Phase::Connecting {
         attempt,
         device: device.clone(),
      };
      self.emit_state();

      let stack = self.stack.clone();
      let loopback = self.loopback_tx.clone();
      tokio::spawn(async move {
         let result = stack.open(&device).await;
         if let Err(e) = &result {
            warn!("Failed to connect to {}: {e}", device.address);
         }
         if let Err(e) = loopback
            .send(ManagerCommand::ConnectFinished {
               attempt,
               device,
               result,
               reply,
            })
            .await
         {
            warn!("Channel closed sending connect result: {e}");
         }
      });
   }

   async fn handle_connect_finished(
      &mut self,
      attempt: u64,
      device: Device,
      result: Result<S::Link>,
   ) -> Result<()> {
      let current = matches!(
         &self.phase,
         Phase::Connecting { attempt: a, .. } if *a == attempt
      );
      if !current {
         if let Ok(link) = result {
            info!("Closing late connection to {}", device.address);
            close_link(Some(link)).await;
         }
         return Err(SignError::ConnectionClosed);
      }

      match result {
         Ok(link) => {
            let name = device.display_name();
            info!("Connected to {name} ({})", device.address);
            self.phase = Phase::Active(Session {
               device,
               link: Some(link),
            });
            self.emit_state();
            self.notice(Notice::Connected(name));
            Ok(())
         },
         Err(e) => {
            self.phase = Phase::Idle;
            self.emit_state();
            self.notice(Notice::ConnectFailed(e.to_string()));
            Err(e)
         },
      }
   }

   async fn send(&mut self, payload: &str) -> Result<()> {
      let Phase::Active(Session {
         device,
         link: Some(link),
      }) = &self.phase
      else {
         self.notice(Notice::Disconnected);
         return Err(SignError::NotConnected);
      };

      let frame = frame::encode_frame(payload);
      let address = device.address;
      let result = link.write(&frame).await;

      match result {
         Ok(()) => {
            debug!("Sent {} bytes to {address}", frame.len());
            self.notice(Notice::Sent);
            Ok(())
         },
         Err(e) => {
            warn!("Send to {address} failed: {e}");
            self.notice(Notice::SendFailed);
            self.teardown().await;
            Err(SignError::SendFailed(e.to_string()))
         },
      }
   }

   async fn disconnect(&mut self) {
      self.teardown().await;
      if self.gate.is_granted()
         && let Err(e) = self.refresh_devices().await
      {
         warn!("Device refresh after disconnect failed: {e}");
      }
   }

   fn handle_system_connected(&mut self, device: Device) {
      if !matches!(self.phase, Phase::Idle) {
         debug!("Ignoring system connect of {}", device.address);
         return;
      }

      // Prefer the name from the snapshot when the event carries none
      let device = match device.name {
         Some(_) => device,
         None => self
            .devices
            .iter()
            .find(|d| d.address == device.address)
            .cloned()
            .unwrap_or(device),
      };
      info!(
         "{} ({}) connected by the system",
         device.display_name(),
         device.address
      );
      self.phase = Phase::Active(Session { device, link: None });
      self.emit_state();
   }

   async fn handle_system_disconnected(&mut self, addr: Address) {
      match &self.phase {
         Phase::Active(session) if session.device.address == addr => {
            info!("{addr} disconnected by the system");
            self.teardown().await;
         },
         _ => debug!("Ignoring system disconnect of {addr}"),
      }
   }

   async fn check_link_health(&mut self) {
      let lost = match &self.phase {
         Phase::Active(Session {
            device,
            link: Some(link),
         }) if !link.is_open() => Some(device.address),
         _ => None,
      };
      if let Some(addr) = lost {
         warn!("Link to {addr} lost");
         self.teardown().await;
      }
   }

   /// Ends the current session or connection attempt and closes its link.
   async fn teardown(&mut self) {
      let link = match mem::replace(&mut self.phase, Phase::Idle) {
         Phase::Idle => return,
         Phase::Connecting { device, .. } => {
            info!("Abandoning connection attempt to {}", device.address);
            None
         },
         Phase::Active(session) => {
            info!("Disconnected from {}", session.device.address);
            session.link
         },
      };
      close_link(link).await;
      self.emit_state();
   }
}

/// Closes `link`, logging close-time errors instead of returning them.
async fn close_link<L: SerialLink>(link: Option<L>) {
   let Some(link) = link else {
      return;
   };
   if let Err(e) = link.close().await {
      warn!("Error closing link: {e}");
   }
}

#[cfg(test)]
mod tests {
   use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

   use tokio::sync::Notify;

   use super::*;
   use crate::event::EventBus;

   #[derive(Default)]
   struct LinkProbe {
      writes: parking_lot::Mutex<Vec<Vec<u8>>>,
      fail_writes: AtomicBool,
      fail_close: AtomicBool,
      open: AtomicBool,
      closes: AtomicUsize,
   }

   #[derive(Clone, Default)]
   struct MockLink(Arc<LinkProbe>);

   impl SerialLink for MockLink {
      async fn write(&self, frame: &[u8]) -> Result<()> {
         if self.0.fail_writes.load(Ordering::SeqCst) {
            return Err(SignError::Io(std::io::Error::new(
               std::io::ErrorKind::BrokenPipe,
               "broken pipe",
            )));
         }
         self.0.writes.lock().push(frame.to_vec());
         Ok(())
      }

      async fn close(&self) -> Result<()> {
         self.0.closes.fetch_add(1, Ordering::SeqCst);
         self.0.open.store(false, Ordering::SeqCst);
         if self.0.fail_close.load(Ordering::SeqCst) {
            return Err(SignError::Io(std::io::Error::other("close failed")));
         }
         Ok(())
      }

      fn is_open(&self) -> bool {
         self.0.open.load(Ordering::SeqCst)
      }
   }

   #[derive(Default)]
   struct MockStack {
      devices: Vec<Device>,
      granted: AtomicBool,
      grant_on_request: bool,
      fail_connect: AtomicBool,
      hold_connect: Option<Arc<Notify>>,
      opened: AtomicUsize,
      link: MockLink,
   }

   impl MockStack {
      fn probe(&self) -> &LinkProbe {
         &self.link.0
      }

      fn writes(&self) -> Vec<Vec<u8>> {
         self.probe().writes.lock().clone()
      }
   }

   impl BluetoothStack for MockStack {
      type Link = MockLink;

      async fn has_required_permissions(&self) -> bool {
         self.granted.load(Ordering::SeqCst)
      }

      async fn request_permissions(&self) -> Result<bool> {
         if self.grant_on_request {
            self.granted.store(true, Ordering::SeqCst);
         }
         Ok(self.grant_on_request)
      }

      async fn bonded_devices(&self) -> Result<Vec<Device>> {
         Ok(self.devices.clone())
      }

      async fn open(&self, _device: &Device) -> Result<MockLink> {
         if let Some(hold) = &self.hold_connect {
            hold.notified().await;
         }
         self.opened.fetch_add(1, Ordering::SeqCst);
         if self.fail_connect.load(Ordering::SeqCst) {
            return Err(SignError::Io(std::io::Error::new(
               std::io::ErrorKind::ConnectionRefused,
               "host is down",
            )));
         }
         self.probe().open.store(true, Ordering::SeqCst);
         Ok(self.link.clone())
      }
   }

   #[derive(Default)]
   struct RecordingBus(parking_lot::Mutex<Vec<SignEvent>>);

   impl EventBus for RecordingBus {
      fn emit(&self, event: SignEvent) {
         self.0.lock().push(event);
      }
   }

   impl RecordingBus {
      fn notices(&self) -> Vec<Notice> {
         self
            .0
            .lock()
            .iter()
            .filter_map(|e| match e {
               SignEvent::Notice(n) => Some(n.clone()),
               _ => None,
            })
            .collect()
      }

      fn states(&self) -> Vec<LinkState> {
         self
            .0
            .lock()
            .iter()
            .filter_map(|e| match e {
               SignEvent::StateChanged(s) => Some(s.state),
               _ => None,
            })
            .collect()
      }
   }

   fn sign() -> Device {
      Device::new(
         Address::new([0x98, 0xD3, 0x31, 0xF6, 0x1A, 0x2B]),
         Some("LED-Sign"),
      )
   }

   fn headset() -> Device {
      Device::new(Address::new([0x00, 0x1B, 0x66, 0x01, 0x02, 0x03]), None::<&str>)
   }

   fn granted_stack() -> MockStack {
      MockStack {
         devices: vec![sign(), headset()],
         granted: AtomicBool::new(true),
         ..Default::default()
      }
   }

   async fn start(
      stack: MockStack,
   ) -> (ConnectionManager<MockStack>, Arc<MockStack>, Arc<RecordingBus>) {
      let stack = Arc::new(stack);
      let bus = Arc::new(RecordingBus::default());
      let manager = ConnectionManager::new(
         stack.clone(),
         Arc::new(PermissionGate::new()),
         bus.clone(),
         Duration::from_secs(3600),
      );
      let _ = manager.request_permissions().await;
      (manager, stack, bus)
   }

   #[tokio::test]
   async fn test_connect_success_records_device() {
      let (manager, _stack, bus) = start(granted_stack()).await;

      for device in [sign(), headset()] {
         manager.connect(device.clone()).await.unwrap();
         let status = manager.status().await;
         assert_eq!(status.state, LinkState::Connected);
         assert_eq!(status.device, Some(device.clone()));
         manager.disconnect().await.unwrap();
      }

      let notices = bus.notices();
      assert!(notices.contains(&Notice::Connected("LED-Sign".into())));
      assert!(notices.contains(&Notice::Connected("00:1B:66:01:02:03".into())));
   }

   #[tokio::test]
   async fn test_connect_failure_leaves_no_identity() {
      let stack = granted_stack();
      stack.fail_connect.store(true, Ordering::SeqCst);
      let (manager, _stack, bus) = start(stack).await;

      let err = manager.connect(sign()).await.unwrap_err();
      assert!(matches!(err, SignError::Io(_)));

      assert_eq!(manager.status().await, Status::disconnected());
      assert!(matches!(
         bus.notices().last(),
         Some(Notice::ConnectFailed(msg)) if msg.contains("host is down")
      ));
      assert_eq!(
         bus.states(),
         vec![LinkState::Connecting, LinkState::Disconnected]
      );
   }

   #[tokio::test]
   async fn test_send_while_disconnected_never_writes() {
      let (manager, stack, bus) = start(granted_stack()).await;

      let err = manager.send("!1,Hello&").await.unwrap_err();
      assert!(matches!(err, SignError::NotConnected));
      assert!(stack.writes().is_empty());
      assert_eq!(bus.notices().last(), Some(&Notice::Disconnected));
   }

   #[tokio::test]
   async fn test_send_writes_framed_gbk_bytes() {
      let (manager, stack, bus) = start(granted_stack()).await;
      manager.connect(sign()).await.unwrap();

      manager.send("!1,你好&").await.unwrap();
      assert!(manager.send_text(Direction::Right, "Hello").await.unwrap());

      assert_eq!(
         stack.writes(),
         vec![
            vec![b'@', b'!', b'1', b',', 0xC4, 0xE3, 0xBA, 0xC3, b'&', b'\r', b'\n'],
            b"@!2,Hello&\r\n".to_vec(),
         ]
      );
      assert_eq!(bus.notices().last(), Some(&Notice::Sent));
   }

   #[tokio::test]
   async fn test_empty_text_is_never_sent() {
      let (manager, stack, bus) = start(granted_stack()).await;
      manager.connect(sign()).await.unwrap();
      let notices_before = bus.notices().len();

      assert!(!manager.send_text(Direction::Left, "").await.unwrap());
      assert!(stack.writes().is_empty());
      assert_eq!(bus.notices().len(), notices_before);
   }

   #[tokio::test]
   async fn test_write_failure_tears_down_session() {
      let (manager, stack, bus) = start(granted_stack()).await;
      manager.connect(sign()).await.unwrap();
      stack.probe().fail_writes.store(true, Ordering::SeqCst);

      let err = manager.send("!1,Hi&").await.unwrap_err();
      assert!(matches!(err, SignError::SendFailed(_)));
      assert_eq!(bus.notices().last(), Some(&Notice::SendFailed));
      assert_eq!(manager.status().await, Status::disconnected());
      assert_eq!(stack.probe().closes.load(Ordering::SeqCst), 1);

      // Session is gone, so the next send is refused without writing
      stack.probe().fail_writes.store(false, Ordering::SeqCst);
      assert!(matches!(
         manager.send("!1,Hi&").await,
         Err(SignError::NotConnected)
      ));
      assert!(stack.writes().is_empty());
   }

   #[tokio::test]
   async fn test_system_disconnect_clears_session() {
      let (manager, stack, _bus) = start(granted_stack()).await;
      manager.connect(sign()).await.unwrap();

      manager.on_system_disconnect(sign().address).await;
      assert_eq!(manager.status().await, Status::disconnected());
      assert_eq!(stack.probe().closes.load(Ordering::SeqCst), 1);
   }

   #[tokio::test]
   async fn test_system_disconnect_races_user_disconnect() {
      let (manager, stack, _bus) = start(granted_stack()).await;
      manager.connect(sign()).await.unwrap();

      let (user, ()) = tokio::join!(
         manager.disconnect(),
         manager.on_system_disconnect(sign().address)
      );
      user.unwrap();

      assert_eq!(manager.status().await, Status::disconnected());
      assert_eq!(stack.probe().closes.load(Ordering::SeqCst), 1);
   }

   #[tokio::test]
   async fn test_system_disconnect_of_other_device_is_ignored() {
      let (manager, _stack, _bus) = start(granted_stack()).await;
      manager.connect(sign()).await.unwrap();

      manager.on_system_disconnect(headset().address).await;
      assert_eq!(manager.status().await.state, LinkState::Connected);
   }

   #[tokio::test]
   async fn test_disconnect_is_idempotent() {
      let (manager, stack, _bus) = start(granted_stack()).await;
      manager.disconnect().await.unwrap();

      manager.connect(sign()).await.unwrap();
      manager.disconnect().await.unwrap();
      manager.disconnect().await.unwrap();

      assert_eq!(manager.status().await, Status::disconnected());
      assert_eq!(stack.probe().closes.load(Ordering::SeqCst), 1);
   }

   #[tokio::test]
   async fn test_close_errors_are_swallowed() {
      let (manager, stack, _bus) = start(granted_stack()).await;
      manager.connect(sign()).await.unwrap();
      stack.probe().fail_close.store(true, Ordering::SeqCst);

      manager.disconnect().await.unwrap();
      assert_eq!(manager.status().await, Status::disconnected());
   }

   #[tokio::test]
   async fn test_second_connect_is_rejected() {
      let (manager, stack, _bus) = start(granted_stack()).await;
      manager.connect(sign()).await.unwrap();

      let err = manager.connect(headset()).await.unwrap_err();
      assert!(matches!(err, SignError::AlreadyConnected(addr) if addr == sign().address));
      assert_eq!(manager.status().await.device, Some(sign()));
      assert_eq!(stack.opened.load(Ordering::SeqCst), 1);
   }

   #[tokio::test]
   async fn test_connect_while_connecting_is_rejected() {
      let hold = Arc::new(Notify::new());
      let stack = MockStack {
         hold_connect: Some(hold.clone()),
         ..granted_stack()
      };
      let (manager, _stack, _bus) = start(stack).await;

      let first = tokio::spawn({
         let manager = manager.clone();
         async move { manager.connect(sign()).await }
      });
      while manager.status().await.state != LinkState::Connecting {
         tokio::task::yield_now().await;
      }

      assert!(matches!(
         manager.connect(sign()).await,
         Err(SignError::AlreadyConnecting)
      ));

      hold.notify_one();
      first.await.unwrap().unwrap();
      assert_eq!(manager.status().await.state, LinkState::Connected);
   }

   #[tokio::test]
   async fn test_disconnect_abandons_pending_connect() {
      let hold = Arc::new(Notify::new());
      let stack = MockStack {
         hold_connect: Some(hold.clone()),
         ..granted_stack()
      };
      let (manager, stack, _bus) = start(stack).await;

      let pending = tokio::spawn({
         let manager = manager.clone();
         async move { manager.connect(sign()).await }
      });
      while manager.status().await.state != LinkState::Connecting {
         tokio::task::yield_now().await;
      }

      manager.disconnect().await.unwrap();
      assert_eq!(manager.status().await, Status::disconnected());

      hold.notify_one();
      assert!(matches!(
         pending.await.unwrap(),
         Err(SignError::ConnectionClosed)
      ));
      assert_eq!(manager.status().await, Status::disconnected());
      assert_eq!(stack.probe().closes.load(Ordering::SeqCst), 1);
   }

   #[tokio::test]
   async fn test_system_connect_creates_linkless_session() {
      let (manager, stack, _bus) = start(granted_stack()).await;

      manager
         .on_system_connected(Device::new(sign().address, None::<&str>))
         .await;
      let status = manager.status().await;
      assert_eq!(status.state, LinkState::Connected);
      // Name is taken from the device snapshot
      assert_eq!(status.device, Some(sign()));

      assert!(matches!(
         manager.send("!1,Hi&").await,
         Err(SignError::NotConnected)
      ));
      assert!(stack.writes().is_empty());

      // An explicit connect replaces the link-less session
      manager.connect(sign()).await.unwrap();
      manager.send("!1,Hi&").await.unwrap();
      assert_eq!(stack.writes(), vec![b"@!1,Hi&\r\n".to_vec()]);

      manager.on_system_disconnect(sign().address).await;
      assert_eq!(manager.status().await, Status::disconnected());
   }

   #[tokio::test]
   async fn test_system_connect_while_connected_is_ignored() {
      let (manager, _stack, _bus) = start(granted_stack()).await;
      manager.connect(sign()).await.unwrap();

      manager.on_system_connected(headset()).await;
      assert_eq!(manager.status().await.device, Some(sign()));
   }

   #[tokio::test]
   async fn test_permission_denied_blocks_enumeration_and_connect() {
      let stack = MockStack {
         devices: vec![sign()],
         ..Default::default()
      };
      let (manager, stack, bus) = start(stack).await;

      assert!(manager.devices().await.is_empty());
      assert!(matches!(
         manager.refresh_devices().await,
         Err(SignError::PermissionDenied)
      ));
      assert!(matches!(
         manager.connect(sign()).await,
         Err(SignError::PermissionDenied)
      ));
      assert_eq!(stack.opened.load(Ordering::SeqCst), 0);
      assert!(
         bus.notices()
            .iter()
            .all(|n| *n == Notice::PermissionDenied)
      );
      assert!(!bus.notices().is_empty());
   }

   #[tokio::test]
   async fn test_permission_request_refreshes_devices() {
      let stack = MockStack {
         devices: vec![sign(), headset()],
         grant_on_request: true,
         ..Default::default()
      };
      let (manager, _stack, bus) = start(stack).await;

      assert_eq!(manager.devices().await, vec![sign(), headset()]);
      assert!(
         bus.0
            .lock()
            .iter()
            .any(|e| matches!(e, SignEvent::DevicesRefreshed(d) if d.len() == 2))
      );
   }

   #[tokio::test(start_paused = true)]
   async fn test_health_check_drops_dead_link() {
      let stack = Arc::new(granted_stack());
      let bus = Arc::new(RecordingBus::default());
      let manager = ConnectionManager::new(
         stack.clone(),
         Arc::new(PermissionGate::new()),
         bus.clone(),
         Duration::from_secs(1),
      );
      manager.request_permissions().await.unwrap();
      manager.connect(sign()).await.unwrap();

      stack.probe().open.store(false, Ordering::SeqCst);
      time::sleep(Duration::from_secs(3)).await;

      assert_eq!(manager.status().await, Status::disconnected());
   }
}
