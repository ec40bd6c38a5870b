//! Bluetooth layer for HID emulation.
//!
//! This module provides the L2CAP server channel pair, the radio
//! control boundary, and the connection lifecycle manager.

pub mod channel;
pub mod manager;
pub mod radio;
