//! BER encoding buffer
//!
//! The read side of the crate goes through `asn1-rs`; this module is the
//! write side: a growable buffer producing definite-length DER-style
//! encodings (short-form lengths below 128, minimal long form otherwise,
//! minimal two's-complement INTEGERs).

/// Universal tags used by the protocol encoders
pub const TAG_BOOLEAN: u8 = 0x01;
pub const TAG_INTEGER: u8 = 0x02;
pub const TAG_OCTET_STRING: u8 = 0x04;
pub const TAG_NULL: u8 = 0x05;
pub const TAG_ENUMERATED: u8 = 0x0a;
pub const TAG_SEQUENCE: u8 = 0x30;
pub const TAG_SET: u8 = 0x31;

/// Handle for an open constructed scope, returned by [`BerWriter::begin`]
///
/// Scopes must be ended in LIFO order; ending an outer scope while an inner
/// one is still open corrupts the length prefixes.
#[derive(Debug)]
#[must_use = "an unfinished scope leaves a zero length prefix in the buffer"]
pub struct Scope {
    /// position of the single-byte length placeholder
    len_pos: usize,
    depth: usize,
}

/// A growable BER encoding buffer
///
/// Constructed elements are written by opening a scope, writing the content,
/// and closing the scope, which back-patches the length prefix. Back-patching
/// a length of 128 bytes or more shifts the trailing bytes to make room for
/// the long-form length.
#[derive(Debug, Default)]
pub struct BerWriter {
    buf: Vec<u8>,
    depth: usize,
}

impl BerWriter {
    pub fn new() -> Self {
        BerWriter::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        BerWriter {
            buf: Vec::with_capacity(capacity),
            depth: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finish encoding and take the bytes. All scopes must be closed.
    pub fn into_bytes(self) -> Vec<u8> {
        debug_assert_eq!(self.depth, 0, "unclosed BER scope");
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Open a constructed element with the given identifier byte
    pub fn begin(&mut self, tag: u8) -> Scope {
        self.buf.push(tag);
        let len_pos = self.buf.len();
        self.buf.push(0x00);
        self.depth += 1;
        Scope {
            len_pos,
            depth: self.depth,
        }
    }

    /// Close a constructed element, back-patching its length prefix
    pub fn end(&mut self, scope: Scope) {
        debug_assert_eq!(scope.depth, self.depth, "BER scopes closed out of order");
        self.depth -= 1;
        let content_len = self.buf.len() - scope.len_pos - 1;
        if content_len < 128 {
            self.buf[scope.len_pos] = content_len as u8;
        } else {
            let extra = long_form_bytes(content_len);
            self.buf[scope.len_pos] = 0x80 | extra.len() as u8;
            // shift trailing content to make room for the long-form length
            self.buf
                .splice(scope.len_pos + 1..scope.len_pos + 1, extra.iter().copied());
        }
    }

    /// Write a primitive element: identifier, length, content
    pub fn write_primitive(&mut self, tag: u8, content: &[u8]) {
        self.buf.push(tag);
        self.push_len(content.len());
        self.buf.extend_from_slice(content);
    }

    pub fn write_boolean(&mut self, value: bool) {
        self.write_primitive(TAG_BOOLEAN, &[if value { 0xff } else { 0x00 }]);
    }

    /// INTEGER in minimal two's-complement form (always at least one
    /// content byte)
    pub fn write_integer(&mut self, value: i64) {
        let bytes = minimal_twos_complement(value);
        self.write_primitive(TAG_INTEGER, &bytes);
    }

    /// INTEGER with a non-universal identifier (implicit tagging)
    pub fn write_tagged_integer(&mut self, tag: u8, value: i64) {
        let bytes = minimal_twos_complement(value);
        self.write_primitive(tag, &bytes);
    }

    pub fn write_enumerated(&mut self, value: u32) {
        let bytes = minimal_twos_complement(i64::from(value));
        self.write_primitive(TAG_ENUMERATED, &bytes);
    }

    pub fn write_null(&mut self) {
        self.write_primitive(TAG_NULL, &[]);
    }

    pub fn write_octet_string(&mut self, content: &[u8]) {
        self.write_primitive(TAG_OCTET_STRING, content);
    }

    pub fn write_str(&mut self, content: &str) {
        self.write_primitive(TAG_OCTET_STRING, content.as_bytes());
    }

    /// Append raw, already-encoded bytes
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn push_len(&mut self, len: usize) {
        if len < 128 {
            self.buf.push(len as u8);
        } else {
            let extra = long_form_bytes(len);
            self.buf.push(0x80 | extra.len() as u8);
            self.buf.extend_from_slice(&extra);
        }
    }
}

/// Big-endian content bytes of a long-form length, without leading zeros
fn long_form_bytes(len: usize) -> Vec<u8> {
    let mut bytes = len.to_be_bytes().to_vec();
    while bytes.len() > 1 && bytes[0] == 0 {
        bytes.remove(0);
    }
    bytes
}

/// Minimal two's-complement encoding of an INTEGER, at least one byte
fn minimal_twos_complement(value: i64) -> Vec<u8> {
    let mut bytes = value.to_be_bytes().to_vec();
    // drop redundant leading bytes while the sign bit stays intact
    while bytes.len() > 1 {
        let drop = (bytes[0] == 0x00 && bytes[1] & 0x80 == 0)
            || (bytes[0] == 0xff && bytes[1] & 0x80 != 0);
        if !drop {
            break;
        }
        bytes.remove(0);
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_integer_minimal_encoding() {
        let cases: &[(i64, &[u8])] = &[
            (0, &hex!("02 01 00")),
            (1, &hex!("02 01 01")),
            (127, &hex!("02 01 7f")),
            (128, &hex!("02 02 00 80")),
            (256, &hex!("02 02 01 00")),
            (-1, &hex!("02 01 ff")),
            (-128, &hex!("02 01 80")),
            (-129, &hex!("02 02 ff 7f")),
            (i64::MAX, &hex!("02 08 7f ff ff ff ff ff ff ff")),
        ];
        for (value, expected) in cases {
            let mut w = BerWriter::new();
            w.write_integer(*value);
            assert_eq!(w.as_bytes(), *expected, "encoding {}", value);
        }
    }

    #[test]
    fn test_boolean_and_null() {
        let mut w = BerWriter::new();
        w.write_boolean(true);
        w.write_boolean(false);
        w.write_null();
        assert_eq!(w.as_bytes(), &hex!("01 01 ff 01 01 00 05 00"));
    }

    #[test]
    fn test_short_form_length() {
        let mut w = BerWriter::new();
        w.write_octet_string(&[0x41; 127]);
        assert_eq!(w.as_bytes()[0], TAG_OCTET_STRING);
        assert_eq!(w.as_bytes()[1], 127);
        assert_eq!(w.len(), 129);
    }

    #[test]
    fn test_long_form_length() {
        let mut w = BerWriter::new();
        w.write_octet_string(&[0x41; 128]);
        assert_eq!(&w.as_bytes()[..3], &[TAG_OCTET_STRING, 0x81, 0x80]);

        let mut w = BerWriter::new();
        w.write_octet_string(&[0x41; 300]);
        assert_eq!(&w.as_bytes()[..4], &[TAG_OCTET_STRING, 0x82, 0x01, 0x2c]);
    }

    #[test]
    fn test_sequence_backpatch_short() {
        let mut w = BerWriter::new();
        let seq = w.begin(TAG_SEQUENCE);
        w.write_integer(5);
        w.write_str("abc");
        w.end(seq);
        assert_eq!(w.as_bytes(), &hex!("30 08 02 01 05 04 03 61 62 63"));
    }

    #[test]
    fn test_sequence_backpatch_long_shifts_content() {
        let mut w = BerWriter::new();
        let seq = w.begin(TAG_SEQUENCE);
        w.write_octet_string(&[0x5a; 200]);
        w.end(seq);
        // inner: 04 81 c8 <200 bytes> = 203; outer: 30 81 cb
        let bytes = w.into_bytes();
        assert_eq!(&bytes[..3], &[TAG_SEQUENCE, 0x81, 0xcb]);
        assert_eq!(&bytes[3..6], &[TAG_OCTET_STRING, 0x81, 0xc8]);
        assert_eq!(bytes.len(), 206);
    }

    #[test]
    fn test_nested_scopes() {
        let mut w = BerWriter::new();
        let outer = w.begin(TAG_SEQUENCE);
        let inner = w.begin(TAG_SET);
        w.write_integer(1);
        w.end(inner);
        w.end(outer);
        assert_eq!(w.as_bytes(), &hex!("30 05 31 03 02 01 01"));
    }
}
