//! Input translators: local input events to HID reports.
//!
//! Two independent producers feed the connection manager's send sink: a
//! keyboard translator tracking held keys and modifiers, and a pointer
//! translator accumulating relative motion and button state. Neither
//! performs I/O; the ACCEPTED-only gate lives in the manager.

use smallvec::SmallVec;

use crate::hid::{
   keymap,
   report::{HidReport, KeyboardReport, MAX_KEYS, MouseReport, modifier, modifier_bit},
};

/// Tracks held modifier and regular keys for one session.
///
/// Every press/release transition yields the full report the host must
/// see, including the all-zero release after a tap so the host never
/// considers a key stuck down.
#[derive(Debug, Default)]
pub struct KeyboardTranslator {
   modifiers: u8,
   pressed: SmallVec<[u8; MAX_KEYS]>,
}

impl KeyboardTranslator {
   pub fn new() -> Self {
      Self::default()
   }

   fn report(&self) -> KeyboardReport {
      KeyboardReport::new(self.modifiers, &self.pressed)
   }

   /// Registers a key press and returns the resulting report.
   ///
   /// Modifier usages (0xE0..=0xE7) set their bitmask bit instead of
   /// occupying a key slot.
   pub fn key_down(&mut self, usage: u8) -> KeyboardReport {
      if let Some(bit) = modifier_bit(usage) {
         self.modifiers |= bit;
      } else if !self.pressed.contains(&usage) {
         self.pressed.push(usage);
      }
      self.report()
   }

   /// Registers a key release and returns the resulting report.
   pub fn key_up(&mut self, usage: u8) -> KeyboardReport {
      if let Some(bit) = modifier_bit(usage) {
         self.modifiers &= !bit;
      } else {
         self.pressed.retain(|k| *k != usage);
      }
      self.report()
   }

   /// Press-and-release of a single key with extra one-shot modifiers.
   ///
   /// The release report is all-zero, dropping the one-shot modifiers
   /// together with the key.
   pub fn tap(&mut self, usage: u8, extra_modifiers: u8) -> [KeyboardReport; 2] {
      let down = KeyboardReport::new(self.modifiers | extra_modifiers, &[usage]);
      self.pressed.clear();
      self.modifiers = 0;
      [down, KeyboardReport::released()]
   }

   /// Translates a text string into a report sequence.
   ///
   /// Characters the boot keyboard cannot produce are skipped.
   pub fn type_str(&mut self, text: &str) -> Vec<HidReport> {
      let mut reports = Vec::with_capacity(text.len() * 2);
      for c in text.chars() {
         let Some((usage, shift)) = keymap::usage_for_char(c) else {
            continue;
         };
         let extra = if shift { modifier::LEFT_SHIFT } else { 0 };
         for report in self.tap(usage, extra) {
            reports.push(report.into());
         }
      }
      reports
   }

   /// Drops all held state, e.g. when the host connection is torn down.
   pub fn reset(&mut self) {
      self.modifiers = 0;
      self.pressed.clear();
   }
}

/// Mouse buttons as exposed on the D-Bus surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[repr(u8)]
pub enum MouseButton {
   #[strum(serialize = "left")]
   Left = 1 << 0,
   #[strum(serialize = "right")]
   Right = 1 << 1,
   #[strum(serialize = "middle")]
   Middle = 1 << 2,
}

/// Accumulates pointer button state and chunks motion into reports.
#[derive(Debug, Default)]
pub struct PointerTranslator {
   buttons: u8,
}

impl PointerTranslator {
   pub fn new() -> Self {
      Self::default()
   }

   /// Translates a relative motion delta into one or more reports.
   ///
   /// Deltas beyond the signed-8-bit range are sent as multiple
   /// successive reports rather than overflowing.
   pub fn motion(&self, mut dx: i32, mut dy: i32) -> SmallVec<[MouseReport; 4]> {
      let mut reports = SmallVec::new();
      while dx != 0 || dy != 0 {
         let step = MouseReport::clamped(self.buttons, dx, dy);
         dx -= i32::from(step.dx);
         dy -= i32::from(step.dy);
         reports.push(step);
      }
      reports
   }

   /// Updates button state and returns the report for the transition.
   pub fn button(&mut self, button: MouseButton, pressed: bool) -> MouseReport {
      if pressed {
         self.buttons |= button as u8;
      } else {
         self.buttons &= !(button as u8);
      }
      MouseReport {
         buttons: self.buttons,
         dx: 0,
         dy: 0,
      }
   }

   pub fn reset(&mut self) {
      self.buttons = 0;
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_key_press_and_release() {
      let mut kb = KeyboardTranslator::new();

      let down = kb.key_down(0x04);
      assert_eq!(down.keys[0], 0x04);
      assert_eq!(down.modifiers, 0);

      let up = kb.key_up(0x04);
      assert_eq!(up, KeyboardReport::released());
   }

   #[test]
   fn test_modifier_usage_sets_mask_not_slot() {
      let mut kb = KeyboardTranslator::new();

      let report = kb.key_down(0xE1); // left shift
      assert_eq!(report.modifiers, modifier::LEFT_SHIFT);
      assert_eq!(report.keys, [0; MAX_KEYS]);

      let report = kb.key_down(0x04);
      assert_eq!(report.modifiers, modifier::LEFT_SHIFT);
      assert_eq!(report.keys[0], 0x04);

      kb.key_up(0x04);
      let report = kb.key_up(0xE1);
      assert_eq!(report, KeyboardReport::released());
   }

   #[test]
   fn test_tap_emits_key_up() {
      let mut kb = KeyboardTranslator::new();
      let [down, up] = kb.tap(0x04, modifier::LEFT_SHIFT);
      assert_eq!(
         down.encode().as_slice(),
         &[0x02, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00]
      );
      assert_eq!(up, KeyboardReport::released());
   }

   #[test]
   fn test_type_str_pairs_and_skips() {
      let mut kb = KeyboardTranslator::new();
      let reports = kb.type_str("aé");
      // One mappable char: press + release
      assert_eq!(reports.len(), 2);
      let HidReport::Keyboard(down) = reports[0] else {
         panic!("expected keyboard report");
      };
      assert_eq!(down.keys[0], 0x04);
      let HidReport::Keyboard(up) = reports[1] else {
         panic!("expected keyboard report");
      };
      assert_eq!(up, KeyboardReport::released());
   }

   #[test]
   fn test_type_str_shifted() {
      let mut kb = KeyboardTranslator::new();
      let reports = kb.type_str("A");
      let HidReport::Keyboard(down) = reports[0] else {
         panic!("expected keyboard report");
      };
      assert_eq!(down.modifiers, modifier::LEFT_SHIFT);
      assert_eq!(down.keys[0], 0x04);
   }

   #[test]
   fn test_motion_within_range_is_single_report() {
      let pointer = PointerTranslator::new();
      let reports = pointer.motion(10, -20);
      assert_eq!(reports.len(), 1);
      assert_eq!(reports[0].dx, 10);
      assert_eq!(reports[0].dy, -20);
   }

   #[test]
   fn test_motion_splits_large_deltas() {
      let pointer = PointerTranslator::new();
      let reports = pointer.motion(300, -200);
      let total_dx: i32 = reports.iter().map(|r| i32::from(r.dx)).sum();
      let total_dy: i32 = reports.iter().map(|r| i32::from(r.dy)).sum();
      assert_eq!(total_dx, 300);
      assert_eq!(total_dy, -200);
      assert!(reports.iter().all(|r| r.dx.abs() <= 127));
      assert_eq!(reports.len(), 3);
   }

   #[test]
   fn test_button_state_carried_into_motion() {
      let mut pointer = PointerTranslator::new();
      let report = pointer.button(MouseButton::Left, true);
      assert_eq!(report.buttons, 0x01);

      let drag = pointer.motion(5, 5);
      assert_eq!(drag[0].buttons, 0x01);

      let report = pointer.button(MouseButton::Left, false);
      assert_eq!(report.buttons, 0x00);
   }

   #[test]
   fn test_button_parsing() {
      assert_eq!("left".parse::<MouseButton>().unwrap(), MouseButton::Left);
      assert_eq!("right".parse::<MouseButton>().unwrap(), MouseButton::Right);
      assert!("side".parse::<MouseButton>().is_err());
   }
}
