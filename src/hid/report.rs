//! HID boot-protocol input report encoding.
//!
//! Pure construction of the fixed-size keyboard and mouse reports a
//! Bluetooth HID host expects. The byte layouts here are fixed by the
//! USB HID boot protocol; a single wrong byte breaks host interop.

use crate::bluetooth::channel::Packet;

/// Boot-protocol keyboard report length: modifiers, reserved, 6 key slots.
pub const KEYBOARD_REPORT_LEN: usize = 8;
/// Boot-protocol mouse report length: buttons, dx, dy.
pub const MOUSE_REPORT_LEN: usize = 3;
/// Maximum simultaneous non-modifier keys in a boot-protocol report.
pub const MAX_KEYS: usize = 6;

/// Modifier bitmask values for the first keyboard report byte.
pub mod modifier {
   pub const LEFT_CTRL: u8 = 1 << 0;
   pub const LEFT_SHIFT: u8 = 1 << 1;
   pub const LEFT_ALT: u8 = 1 << 2;
   pub const LEFT_META: u8 = 1 << 3;
   pub const RIGHT_CTRL: u8 = 1 << 4;
   pub const RIGHT_SHIFT: u8 = 1 << 5;
   pub const RIGHT_ALT: u8 = 1 << 6;
   pub const RIGHT_META: u8 = 1 << 7;
}

/// Returns the modifier bit for a modifier key usage (0xE0..=0xE7).
pub const fn modifier_bit(usage: u8) -> Option<u8> {
   if usage >= 0xE0 && usage <= 0xE7 {
      Some(1 << (usage - 0xE0))
   } else {
      None
   }
}

/// Boot-protocol keyboard input report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyboardReport {
   pub modifiers: u8,
   pub keys: [u8; MAX_KEYS],
}

impl KeyboardReport {
   /// Builds a report from the currently pressed keys.
   ///
   /// Keys beyond the sixth are dropped in insertion order; real
   /// boot-protocol keyboards exhibit the same limit.
   pub fn new(modifiers: u8, pressed: &[u8]) -> Self {
      let mut keys = [0u8; MAX_KEYS];
      for (slot, key) in keys.iter_mut().zip(pressed) {
         *slot = *key;
      }
      Self { modifiers, keys }
   }

   /// The all-zero report a host interprets as "no keys held".
   pub const fn released() -> Self {
      Self {
         modifiers: 0,
         keys: [0; MAX_KEYS],
      }
   }

   pub fn encode(&self) -> Packet {
      let mut bytes = Packet::new();
      bytes.push(self.modifiers);
      bytes.push(0x00);
      bytes.extend_from_slice(&self.keys);
      bytes
   }
}

/// Boot-protocol mouse input report with relative deltas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MouseReport {
   pub buttons: u8,
   pub dx: i8,
   pub dy: i8,
}

impl MouseReport {
   /// Builds a report, clamping the deltas to the signed-8-bit range.
   ///
   /// A drag exceeding the range must be split into successive reports
   /// by the caller; see `PointerTranslator::motion`.
   pub fn clamped(buttons: u8, dx: i32, dy: i32) -> Self {
      Self {
         buttons,
         dx: dx.clamp(-127, 127) as i8,
         dy: dy.clamp(-127, 127) as i8,
      }
   }

   pub fn encode(&self) -> Packet {
      let mut bytes = Packet::new();
      bytes.push(self.buttons);
      bytes.push(self.dx as u8);
      bytes.push(self.dy as u8);
      bytes
   }
}

/// An input report ready for transport framing.
///
/// Reports are immutable value objects: constructed once, written once,
/// never buffered or replayed across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HidReport {
   Keyboard(KeyboardReport),
   Mouse(MouseReport),
}

impl HidReport {
   /// Report ID used on the wire, matching the SDP report descriptor.
   pub const fn report_id(&self) -> u8 {
      match self {
         Self::Keyboard(_) => 1,
         Self::Mouse(_) => 2,
      }
   }

   /// Raw report bytes, without transport header or report ID.
   pub fn encode(&self) -> Packet {
      match self {
         Self::Keyboard(report) => report.encode(),
         Self::Mouse(report) => report.encode(),
      }
   }
}

impl From<KeyboardReport> for HidReport {
   fn from(report: KeyboardReport) -> Self {
      Self::Keyboard(report)
   }
}

impl From<MouseReport> for HidReport {
   fn from(report: MouseReport) -> Self {
      Self::Mouse(report)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   // Test-only decoder for round-trip checks.
   fn decode_keyboard(bytes: &[u8]) -> (u8, Vec<u8>) {
      assert_eq!(bytes.len(), KEYBOARD_REPORT_LEN);
      assert_eq!(bytes[1], 0x00, "reserved byte must stay zero");
      let keys = bytes[2..].iter().copied().filter(|&k| k != 0).collect();
      (bytes[0], keys)
   }

   #[test]
   fn test_keyboard_round_trip() {
      let report = KeyboardReport::new(modifier::LEFT_CTRL, &[0x04, 0x05, 0x06]);
      let (modifiers, keys) = decode_keyboard(&report.encode());
      assert_eq!(modifiers, modifier::LEFT_CTRL);
      assert_eq!(keys, vec![0x04, 0x05, 0x06]);
   }

   #[test]
   fn test_keyboard_truncates_to_six_keys() {
      let pressed = [0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b];
      let report = KeyboardReport::new(modifier::LEFT_SHIFT, &pressed);
      let (modifiers, keys) = decode_keyboard(&report.encode());
      assert_eq!(modifiers, modifier::LEFT_SHIFT);
      assert_eq!(keys, pressed[..MAX_KEYS].to_vec());
   }

   #[test]
   fn test_left_shift_a_exact_bytes() {
      // 'a' = usage 0x04 with left shift held
      let report = KeyboardReport::new(0x02, &[0x04]);
      assert_eq!(
         report.encode().as_slice(),
         &[0x02, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00]
      );
   }

   #[test]
   fn test_released_report_is_all_zero() {
      assert_eq!(KeyboardReport::released().encode().as_slice(), &[0u8; 8]);
   }

   #[test]
   fn test_mouse_delta_clamping() {
      let report = MouseReport::clamped(0, 200, -200);
      assert_eq!(report.dx, 127);
      assert_eq!(report.dy, -127);

      let report = MouseReport::clamped(0, -50, 50);
      assert_eq!(report.dx, -50);
      assert_eq!(report.dy, 50);
   }

   #[test]
   fn test_mouse_encoding() {
      let report = MouseReport::clamped(0x01, -1, 2);
      assert_eq!(report.encode().as_slice(), &[0x01, 0xff, 0x02]);
      assert_eq!(report.encode().len(), MOUSE_REPORT_LEN);
   }

   #[test]
   fn test_report_ids() {
      assert_eq!(HidReport::from(KeyboardReport::released()).report_id(), 1);
      assert_eq!(HidReport::from(MouseReport::default()).report_id(), 2);
   }

   #[test]
   fn test_modifier_bits() {
      assert_eq!(modifier_bit(0xE0), Some(modifier::LEFT_CTRL));
      assert_eq!(modifier_bit(0xE1), Some(modifier::LEFT_SHIFT));
      assert_eq!(modifier_bit(0xE7), Some(modifier::RIGHT_META));
      assert_eq!(modifier_bit(0x04), None);
   }

   #[test]
   fn test_encoding_is_deterministic() {
      let a = KeyboardReport::new(0x05, &[0x1e, 0x1f]);
      let b = KeyboardReport::new(0x05, &[0x1e, 0x1f]);
      assert_eq!(a.encode(), b.encode());
   }
}
