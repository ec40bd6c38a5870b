//! Character to HID usage code mapping (US layout).

/// Non-printable usage codes reachable through `type_str`.
pub mod usage {
   pub const ENTER: u8 = 0x28;
   pub const TAB: u8 = 0x2b;
   pub const SPACE: u8 = 0x2c;
}

/// Maps a character to `(usage code, needs shift)` on a US layout.
///
/// Returns `None` for characters the boot keyboard cannot produce;
/// callers skip those rather than fail a whole text send.
pub fn usage_for_char(c: char) -> Option<(u8, bool)> {
   let mapped = match c {
      'a'..='z' => (c as u8 - b'a' + 0x04, false),
      'A'..='Z' => (c.to_ascii_lowercase() as u8 - b'a' + 0x04, true),
      '1'..='9' => (c as u8 - b'1' + 0x1e, false),
      '0' => (0x27, false),
      '!' => (0x1e, true),
      '@' => (0x1f, true),
      '#' => (0x20, true),
      '$' => (0x21, true),
      '%' => (0x22, true),
      '^' => (0x23, true),
      '&' => (0x24, true),
      '*' => (0x25, true),
      '(' => (0x26, true),
      ')' => (0x27, true),
      '\n' => (usage::ENTER, false),
      '\t' => (usage::TAB, false),
      ' ' => (usage::SPACE, false),
      '-' => (0x2d, false),
      '_' => (0x2d, true),
      '=' => (0x2e, false),
      '+' => (0x2e, true),
      '[' => (0x2f, false),
      '{' => (0x2f, true),
      ']' => (0x30, false),
      '}' => (0x30, true),
      '\\' => (0x31, false),
      '|' => (0x31, true),
      ';' => (0x33, false),
      ':' => (0x33, true),
      '\'' => (0x34, false),
      '"' => (0x34, true),
      '`' => (0x35, false),
      '~' => (0x35, true),
      ',' => (0x36, false),
      '<' => (0x36, true),
      '.' => (0x37, false),
      '>' => (0x37, true),
      '/' => (0x38, false),
      '?' => (0x38, true),
      _ => return None,
   };
   Some(mapped)
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_letters() {
      assert_eq!(usage_for_char('a'), Some((0x04, false)));
      assert_eq!(usage_for_char('z'), Some((0x1d, false)));
      assert_eq!(usage_for_char('A'), Some((0x04, true)));
   }

   #[test]
   fn test_digits_and_shifted_symbols() {
      assert_eq!(usage_for_char('1'), Some((0x1e, false)));
      assert_eq!(usage_for_char('0'), Some((0x27, false)));
      assert_eq!(usage_for_char('!'), Some((0x1e, true)));
      assert_eq!(usage_for_char(')'), Some((0x27, true)));
   }

   #[test]
   fn test_whitespace_and_unmappable() {
      assert_eq!(usage_for_char(' '), Some((usage::SPACE, false)));
      assert_eq!(usage_for_char('\n'), Some((usage::ENTER, false)));
      assert_eq!(usage_for_char('é'), None);
   }
}
