//! UTF-8 boundary helpers shared by decoding and streaming.

/// Length of the UTF-8 sequence introduced by `lead`, or `None` for a
/// continuation or invalid lead byte.
fn sequence_len(lead: u8) -> Option<usize> {
    match lead {
        0x00..=0x7F => Some(1),
        0xC2..=0xDF => Some(2),
        0xE0..=0xEF => Some(3),
        0xF0..=0xF4 => Some(4),
        _ => None,
    }
}

/// End of the longest prefix of `bytes[offset..]` that does not stop inside
/// an incomplete multi-byte sequence.
///
/// Invalid bytes count as complete (they are replaced when converted to text);
/// only a well-formed lead whose continuation bytes have not arrived yet is
/// held back.
pub fn get_end_of_valid_utf8(bytes: &[u8], offset: usize) -> usize {
    let mut i = offset.min(bytes.len());
    while i < bytes.len() {
        let Some(len) = sequence_len(bytes[i]) else {
            i += 1;
            continue;
        };
        let end = (i + len).min(bytes.len());
        if !bytes[i + 1..end].iter().all(|b| b & 0xC0 == 0x80) {
            // Stray lead: do not swallow the bytes after it.
            i += 1;
            continue;
        }
        if end < i + len {
            return i;
        }
        i += len;
    }
    bytes.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_text() {
        let s = "héllo 世界".as_bytes();
        assert_eq!(get_end_of_valid_utf8(s, 0), s.len());
        assert_eq!(get_end_of_valid_utf8(s, 3), s.len());
    }

    #[test]
    fn test_truncated_scalar_held_back() {
        let s = "a世".as_bytes();
        assert_eq!(get_end_of_valid_utf8(&s[..2], 0), 1);
        assert_eq!(get_end_of_valid_utf8(&s[..3], 0), 1);
        assert_eq!(get_end_of_valid_utf8(s, 0), 4);
    }

    #[test]
    fn test_invalid_bytes_pass_through() {
        assert_eq!(get_end_of_valid_utf8(&[0x80, b'a'], 0), 2);
        assert_eq!(get_end_of_valid_utf8(&[0xE4, b'a'], 0), 2);
    }

    #[test]
    fn test_stray_lead_before_truncated_scalar() {
        // 0xE4 'a' then the first two bytes of U+4E16.
        assert_eq!(get_end_of_valid_utf8(&[0xE4, b'a', 0xE4, 0xB8], 0), 2);
        assert_eq!(get_end_of_valid_utf8(&[0xE4, b'a', 0xE4, 0xB8, 0x96], 0), 5);
    }

    #[test]
    fn test_offset_past_end() {
        assert_eq!(get_end_of_valid_utf8(b"ab", 5), 2);
    }
}
