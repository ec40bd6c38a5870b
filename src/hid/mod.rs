//! HID report construction and input translation.
//!
//! This module contains the boot-protocol report encoder, the character
//! to usage-code map, and the translators that turn local input events
//! into report sequences.

pub mod input;
pub mod keymap;
pub mod report;
