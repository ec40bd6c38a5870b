//! Error types for the HID emulation service.
//!
//! This module defines all error types that can occur while serving a
//! Bluetooth HID host, including radio, L2CAP, D-Bus and configuration
//! errors.

use thiserror::Error;

/// Main error type for the HID emulation service.
#[derive(Error, Debug)]
pub enum BlueHidError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Bluetooth adapter unavailable")]
   RadioUnavailable,

   #[error("No host connected within the accept window")]
   TimedOut,

   #[error("Host disconnected")]
   PeerDisconnected,

   #[error("Not connected to a host")]
   NotConnected,

   #[error("Host violated the HID connection sequence: {0}")]
   ProtocolViolation(&'static str),

   #[error("Invalid device address: {0}")]
   InvalidAddress(String),

   #[error("Manager has been shut down")]
   ManagerShutdown,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

/// Convenience type alias for Results with `BlueHidError`.
pub type Result<T> = std::result::Result<T, BlueHidError>;
