//! Access gate in front of device enumeration and connection.
//!
//! The gate remembers whether the platform granted access. Until it has,
//! the connection manager refuses to list or connect to devices.

use std::sync::atomic::{AtomicBool, Ordering};

use log::{info, warn};

use crate::{
   bluetooth::BluetoothStack,
   error::{Result, SignError},
};

#[derive(Debug, Default)]
pub struct PermissionGate {
   granted: AtomicBool,
}

impl PermissionGate {
   pub const fn new() -> Self {
      Self {
         granted: AtomicBool::new(false),
      }
   }

   pub fn is_granted(&self) -> bool {
      self.granted.load(Ordering::Relaxed)
   }

   /// Re-checks access without prompting.
   pub async fn check<S: BluetoothStack>(&self, stack: &S) -> bool {
      let granted = stack.has_required_permissions().await;
      self.granted.store(granted, Ordering::Relaxed);
      granted
   }

   /// Checks access and requests it when missing.
   ///
   /// Returns `PermissionDenied` when the platform refuses.
   pub async fn acquire<S: BluetoothStack>(&self, stack: &S) -> Result<()> {
      if self.check(stack).await {
         return Ok(());
      }

      info!("Bluetooth access missing, requesting it");
      let granted = match stack.request_permissions().await {
         Ok(granted) => granted,
         Err(e) if e.is_access_denied() => false,
         Err(e) => {
            warn!("Permission request failed: {e}");
            false
         },
      };
      self.granted.store(granted, Ordering::Relaxed);

      if granted {
         info!("Bluetooth access granted");
         Ok(())
      } else {
         warn!("Bluetooth access denied");
         Err(SignError::PermissionDenied)
      }
   }

   /// Fails with `PermissionDenied` unless access was granted earlier.
   pub fn ensure(&self) -> Result<()> {
      if self.is_granted() {
         Ok(())
      } else {
         Err(SignError::PermissionDenied)
      }
   }
}
