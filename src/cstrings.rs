//! NUL-terminated string fields as they appear in milter payloads.
//!
//! Field content is decoded lossily: invalid UTF-8 sequences become U+FFFD.

/// Returns the leading NUL-terminated run of `data`, or all of `data` when it
/// contains no NUL.
pub fn read_cstring(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

/// Splits off the leading NUL-terminated field. The remainder starts after the
/// NUL and is empty when `data` has no NUL.
pub fn split_cstring(data: &[u8]) -> (&[u8], &[u8]) {
    match data.iter().position(|&b| b == 0) {
        Some(pos) => (&data[..pos], &data[pos + 1..]),
        None => (data, &[]),
    }
}

/// Splits `data` on NUL bytes.
///
/// Empty fields between consecutive NULs are kept. The single empty field
/// produced by a terminating NUL is dropped, so `b"a\0b\0"` and `b"a\0b"` both
/// yield `["a", "b"]` while `b"k\0\0"` yields `["k", ""]`. Empty input yields
/// no fields.
pub fn decode_cstrings(data: &[u8]) -> Vec<String> {
    if data.is_empty() {
        return Vec::new();
    }
    let data = data.strip_suffix(b"\0").unwrap_or(data);
    data.split(|&b| b == 0)
        .map(|field| String::from_utf8_lossy(field).into_owned())
        .collect()
}

/// Encodes `fields` as a sequence of NUL-terminated strings.
pub fn encode_cstrings<S: AsRef<str>>(fields: &[S]) -> Vec<u8> {
    let mut out = Vec::new();
    for field in fields {
        out.extend_from_slice(field.as_ref().as_bytes());
        out.push(0);
    }
    out
}

#[test]
fn test_read_cstring() {
    assert_eq!(read_cstring(b"host\0rest"), "host");
    assert_eq!(read_cstring(b"no terminator"), "no terminator");
    assert_eq!(read_cstring(b"\0"), "");
    assert_eq!(read_cstring(b""), "");
}

#[test]
fn test_split_cstring() {
    assert_eq!(split_cstring(b"host\04rest"), (&b"host"[..], &b"4rest"[..]));
    assert_eq!(split_cstring(b"host"), (&b"host"[..], &b""[..]));
    assert_eq!(split_cstring(b"\0"), (&b""[..], &b""[..]));
}

#[test]
fn test_decode_cstrings() {
    assert!(decode_cstrings(b"").is_empty());
    assert_eq!(decode_cstrings(b"Test1\0Test2\0"), ["Test1", "Test2"]);
    assert_eq!(decode_cstrings(b"Test1\0Test2"), ["Test1", "Test2"]);
    assert_eq!(decode_cstrings(b"\0"), [""]);
}

#[test]
fn test_decode_cstrings_keeps_empty_fields() {
    assert_eq!(decode_cstrings(b"k\0\0"), ["k", ""]);
    assert_eq!(decode_cstrings(b"a\0\0b\0"), ["a", "", "b"]);
    assert_eq!(decode_cstrings(b"k\0\0j\0v\0"), ["k", "", "j", "v"]);
}

#[test]
fn test_decode_cstrings_lossy() {
    assert_eq!(decode_cstrings(b"a\xffb\0"), ["a\u{fffd}b"]);
}
