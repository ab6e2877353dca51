//! Configuration management for the LED sign service.
//!
//! This module handles loading and saving configuration from disk,
//! including adapter selection, link timeouts and the default scroll
//! direction.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
   error::{Result, SignError},
   sign::frame::Direction,
};

/// Main configuration structure for the service.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Config {
   /// Adapter to use (e.g. `hci0`); the default adapter when unset.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub adapter: Option<String>,

   /// Fixed RFCOMM channel; the SPP profile is resolved through SDP when unset.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub rfcomm_channel: Option<u8>,

   #[serde(default = "default_connect_timeout")]
   pub connect_timeout_sec: u64,

   #[serde(default = "default_write_timeout")]
   pub write_timeout_sec: u64,

   #[serde(default = "default_health_check_interval")]
   pub health_check_interval: u64,

   #[serde(default)]
   pub default_direction: Direction,
}

const fn default_connect_timeout() -> u64 {
   10
}

const fn default_write_timeout() -> u64 {
   5
}

const fn default_health_check_interval() -> u64 {
   5
}

impl Default for Config {
   fn default() -> Self {
      Self {
         adapter: None,
         rfcomm_channel: None,
         connect_timeout_sec: default_connect_timeout(),
         write_timeout_sec: default_write_timeout(),
         health_check_interval: default_health_check_interval(),
         default_direction: Direction::default(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   /// Loads configuration from `path`, writing the defaults there if absent.
   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   /// Saves the current configuration to `path`.
   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("LEDSIGN_HOME") {
         PathBuf::from(home)
      } else {
         dirs::config_dir().ok_or(SignError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("ledsignd").join("config.toml"))
   }

   pub const fn connect_timeout(&self) -> Duration {
      Duration::from_secs(self.connect_timeout_sec)
   }

   pub const fn write_timeout(&self) -> Duration {
      Duration::from_secs(self.write_timeout_sec)
   }

   pub fn health_check_interval(&self) -> Duration {
      Duration::from_secs(self.health_check_interval.max(1))
   }
}
