//! Utility macros and byte helpers shared by the codec, session and http layers.

/// A macro for early returns with an error if a condition is not met.
///
/// This is similar to the `assert!` macro, but returns an error instead of panicking.
///
/// # Example
///
/// ```ignore
/// ensure!(body.len() <= max_body_len, CodecError::bad_body(body.len(), max_body_len));
/// ```
macro_rules! ensure {
    ($predicate:expr, $error:expr) => {
        if !$predicate {
            return Err($error);
        }
    };
}

pub(crate) use ensure;

/// Returns the offset of the first occurrence of `needle` inside `haystack`.
///
/// Only the bytes currently available are searched, a delimiter that has not
/// arrived yet is simply not found.
pub(crate) fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

#[inline]
pub(crate) fn find_crlf(haystack: &[u8]) -> Option<usize> {
    find_subslice(haystack, b"\r\n")
}

#[inline]
pub(crate) fn find_byte(haystack: &[u8], byte: u8) -> Option<usize> {
    haystack.iter().position(|b| *b == byte)
}

/// Parses an ASCII hex number, surrounding whitespace allowed.
pub(crate) fn parse_hex(bytes: &[u8]) -> Option<usize> {
    let digits = bytes.trim_ascii();
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    let text = std::str::from_utf8(digits).ok()?;
    usize::from_str_radix(text, 16).ok()
}

/// Decodes `%XX` escapes and `+` in a url path or query.
///
/// Returns `None` when an escape is truncated, not hex, or the result is not utf-8.
pub fn decode_url(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let escape = bytes.get(i + 1..i + 3)?;
                if !escape.iter().all(u8::is_ascii_hexdigit) {
                    return None;
                }
                out.push(u8::try_from(parse_hex(escape)?).ok()?);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_subslice() {
        assert_eq!(find_subslice(b"abc\r\ndef", b"\r\n"), Some(3));
        assert_eq!(find_subslice(b"abc\r", b"\r\n"), None);
        assert_eq!(find_subslice(b"", b"\r\n"), None);
        assert_eq!(find_byte(b"GET /", b' '), Some(3));
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex(b"1a"), Some(26));
        assert_eq!(parse_hex(b" FF "), Some(255));
        assert_eq!(parse_hex(b"0"), Some(0));
        assert_eq!(parse_hex(b"zz"), None);
        assert_eq!(parse_hex(b""), None);
        assert_eq!(parse_hex(b"+1"), None);
    }

    #[test]
    fn test_decode_url() {
        assert_eq!(decode_url("/a%20b+c").as_deref(), Some("/a b c"));
        assert_eq!(decode_url("/plain").as_deref(), Some("/plain"));
        assert_eq!(decode_url("/bad%2"), None);
        assert_eq!(decode_url("/bad%zz"), None);
        assert_eq!(decode_url("/bad%2 "), None);
        assert_eq!(decode_url("/bad% a"), None);
        assert_eq!(decode_url("/ok%2fx").as_deref(), Some("/ok/x"));
    }
}
