//! Configuration management for the HID emulation service.
//!
//! This module handles loading and saving configuration from disk,
//! including connection timing parameters and the last served host.

use std::{env, fs, path::PathBuf};

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::error::{BlueHidError, Result};

/// Main configuration structure for the service.
#[derive(Serialize, Deserialize, Clone)]
pub struct Config {
   /// Adapter to bind the listening channels to. Defaults to the system
   /// default adapter.
   #[serde(default)]
   pub adapter: Option<SmolStr>,

   /// Last host this service was started against; restored on startup.
   #[serde(default)]
   pub last_device: Option<SmolStr>,

   #[serde(default = "default_accept_timeout")]
   pub accept_timeout_ms: u64,

   #[serde(default = "default_write_timeout")]
   pub write_timeout_ms: u64,

   #[serde(default = "default_retry_delay")]
   pub retry_delay_sec: u64,

   #[serde(default = "default_device_class")]
   pub device_class: u32,
}

const fn default_accept_timeout() -> u64 {
   1000
}

const fn default_write_timeout() -> u64 {
   500
}

const fn default_retry_delay() -> u64 {
   5
}

/// Class of Device advertising a keyboard/pointing peripheral.
const fn default_device_class() -> u32 {
   0x0025_40
}

impl Default for Config {
   fn default() -> Self {
      Self {
         adapter: None,
         last_device: None,
         accept_timeout_ms: default_accept_timeout(),
         write_timeout_ms: default_write_timeout(),
         retry_delay_sec: default_retry_delay(),
         device_class: default_device_class(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         // Create default config
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      let config_path = Self::config_path()?;

      // Ensure directory exists
      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(bluehid_home) = env::var("BLUEHID_HOME") {
         PathBuf::from(bluehid_home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(BlueHidError::ConfigDirNotFound);
      };

      Ok(config_dir.join("bluehidd").join("config.toml"))
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_save_load_round_trip() {
      let dir = tempfile::tempdir().unwrap();
      // Serialize env access; config_path reads BLUEHID_HOME
      unsafe { env::set_var("BLUEHID_HOME", dir.path()) };

      let mut config = Config::default();
      config.last_device = Some("AA:BB:CC:DD:EE:FF".into());
      config.retry_delay_sec = 2;
      config.save().unwrap();

      let loaded = Config::load().unwrap();
      assert_eq!(loaded.last_device.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
      assert_eq!(loaded.retry_delay_sec, 2);
      assert_eq!(loaded.accept_timeout_ms, 1000);
      assert_eq!(loaded.device_class, 0x0025_40);

      unsafe { env::remove_var("BLUEHID_HOME") };
   }
}
