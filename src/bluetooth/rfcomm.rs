//! RFCOMM stream implementation for LED sign communication.
//!
//! This module opens the serial-port stream to the sign and splits it into
//! a writer task fed through a command channel and a reader task that
//! logs whatever the sign sends back.

use std::sync::{
   Arc,
   atomic::{AtomicBool, Ordering},
};

use bluer::{
   Adapter, Address, Session,
   rfcomm::{
      Profile, Role, SocketAddr, Stream,
      stream::{OwnedReadHalf, OwnedWriteHalf},
   },
};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::{
   io::{AsyncReadExt, AsyncWriteExt},
   select,
   sync::{mpsc, oneshot},
   task::JoinSet,
   time::{self, Duration},
};

use crate::{
   bluetooth::{SPP_UUID, SerialLink},
   error::{Result, SignError},
   sign::frame::Frame,
};

/// Size of the inbound read buffer
const RECV_BUFFER_SIZE: usize = 256;
/// Pending writes before callers start waiting
const COMMAND_QUEUE_SIZE: usize = 16;

/// Time limits applied to a link.
#[derive(Debug, Clone, Copy)]
pub struct LinkTimeouts {
   pub connect: Duration,
   pub write: Duration,
}

enum Command {
   Send {
      data: Frame,
      then: oneshot::Sender<Result<()>>,
   },
   Close {
      then: oneshot::Sender<Result<()>>,
   },
}

/// Sender half of an RFCOMM connection.
///
/// This type is cheaply cloneable.
#[derive(Debug, Clone)]
pub struct RfcommSender {
   tx: mpsc::Sender<Command>,
   write_timeout: Duration,
}

impl RfcommSender {
   pub fn is_connected(&self) -> bool {
      !self.tx.is_closed()
   }

   pub async fn send(&self, data: &[u8]) -> Result<()> {
      if !self.is_connected() {
         return Err(SignError::ConnectionClosed);
      }

      let (tx, rx) = oneshot::channel();
      self
         .tx
         .send(Command::Send {
            data: Frame::from_slice(data),
            then: tx,
         })
         .await
         .map_err(|_| SignError::ConnectionClosed)?;

      time::timeout(self.write_timeout, rx)
         .await
         .map_err(|_| SignError::RequestTimeout)?
         .map_err(|_| SignError::ConnectionClosed)?
   }

   async fn shutdown(&self) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      if self.tx.send(Command::Close { then: tx }).await.is_err() {
         // Writer already gone
         return Ok(());
      }
      time::timeout(self.write_timeout, rx)
         .await
         .map_err(|_| SignError::RequestTimeout)?
         .unwrap_or(Ok(()))
   }
}

/// An open RFCOMM stream to the sign.
#[derive(Debug)]
pub struct RfcommLink {
   address: Address,
   sender: RfcommSender,
   remote_open: Arc<AtomicBool>,
   jset: parking_lot::Mutex<JoinSet<()>>,
}

impl Drop for RfcommLink {
   fn drop(&mut self) {
      self.jset.get_mut().abort_all();
   }
}

impl SerialLink for RfcommLink {
   async fn write(&self, frame: &[u8]) -> Result<()> {
      self.sender.send(frame).await
   }

   async fn close(&self) -> Result<()> {
      debug!("Closing RFCOMM stream to {}", self.address);
      let result = self.sender.shutdown().await;
      self.remote_open.store(false, Ordering::Relaxed);
      self.jset.lock().abort_all();
      result
   }

   fn is_open(&self) -> bool {
      self.sender.is_connected() && self.remote_open.load(Ordering::Relaxed)
   }
}

/// Opens an RFCOMM stream to `address`.
///
/// With a fixed `channel` the socket connects directly; otherwise a client
/// profile for the Serial Port Profile is registered and BlueZ resolves the
/// channel through SDP. A socket that fails half-way is dropped, which
/// closes it.
pub async fn connect(
   session: &Session,
   adapter: &Adapter,
   address: Address,
   channel: Option<u8>,
   timeouts: LinkTimeouts,
) -> Result<RfcommLink> {
   let stream = time::timeout(
      timeouts.connect,
      open_stream(session, adapter, address, channel),
   )
   .await
   .map_err(|_| SignError::RequestTimeout)??;

   info!("RFCOMM stream to {address} established");
   let (reader, writer) = stream.into_split();
   let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
   let remote_open = Arc::new(AtomicBool::new(true));

   let mut jset = JoinSet::new();
   jset.spawn(recv_thread(address, reader, remote_open.clone()));
   jset.spawn(send_thread(address, cmd_rx, writer));

   Ok(RfcommLink {
      address,
      sender: RfcommSender {
         tx: cmd_tx,
         write_timeout: timeouts.write,
      },
      remote_open,
      jset: parking_lot::Mutex::new(jset),
   })
}

async fn open_stream(
   session: &Session,
   adapter: &Adapter,
   address: Address,
   channel: Option<u8>,
) -> Result<Stream> {
   if let Some(channel) = channel {
      debug!("Connecting to {address} on RFCOMM channel {channel}");
      return Ok(Stream::connect(SocketAddr::new(address, channel)).await?);
   }

   debug!("Connecting to {address} via SPP profile {SPP_UUID}");
   let profile = Profile {
      uuid: SPP_UUID,
      role: Some(Role::Client),
      require_authentication: Some(false),
      require_authorization: Some(false),
      auto_connect: Some(false),
      ..Default::default()
   };
   let mut requests = session.register_profile(profile).await?;

   let device = adapter.device(address)?;
   let pending = device.connect_profile(&SPP_UUID);
   tokio::pin!(pending);

   // BlueZ hands the socket over through the profile before ConnectProfile returns
   let request = select! {
      req = requests.next() => req.ok_or(SignError::ConnectionClosed)?,
      res = &mut pending => {
         res?;
         requests.next().await.ok_or(SignError::ConnectionClosed)?
      },
   };

   if request.device() != address {
      return Err(SignError::ConnectFailed(format!(
         "profile connection from unexpected device {}",
         request.device()
      )));
   }
   Ok(request.accept()?)
}

async fn recv_thread(adr: Address, mut reader: OwnedReadHalf, open: Arc<AtomicBool>) {
   let mut buf = [0u8; RECV_BUFFER_SIZE];
   loop {
      match reader.read(&mut buf).await {
         Ok(0) => {
            warn!("{adr}: Remote closed the stream");
            break;
         },
         Ok(n) => debug!("← {adr}: {}", hex::encode(&buf[..n])),
         Err(e) => {
            warn!("{adr}: Read failed: {e}");
            break;
         },
      }
   }
   open.store(false, Ordering::Relaxed);
}

async fn send_thread(adr: Address, mut rx: mpsc::Receiver<Command>, mut writer: OwnedWriteHalf) {
   while let Some(cmd) = rx.recv().await {
      match cmd {
         Command::Send { data, then } => {
            debug!("→ {adr}: {}", hex::encode(&data));
            let result = match writer.write_all(&data).await {
               Ok(()) => writer.flush().await,
               Err(e) => Err(e),
            };
            if let Err(e) = result {
               warn!("Failed to send data: {e}");
               let _ = then.send(Err(SignError::Io(e)));
            } else {
               _ = then.send(Ok(()));
            }
         },
         Command::Close { then } => {
            let result = writer.shutdown().await.map_err(SignError::Io);
            let _ = then.send(result);
            return;
         },
      }
   }
   warn!("{adr}: Writer dropped");
}
