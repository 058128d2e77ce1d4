//! Order-preserving tuple encoding for key-value keys.
//!
//! Byte-compatible with the FoundationDB tuple layer for the two element
//! types used here: byte strings (code `0x02`, `0x00` escaped as
//! `0x00 0xFF`, terminated by `0x00`) and signed integers (codes
//! `0x0C..=0x1C`, minimal big-endian magnitude). Packed tuples compare in
//! the same order as their elements.

use raidstore_common::{Error, Result};

const STRING_CODE: u8 = 0x02;
const INT_ZERO_CODE: u8 = 0x14;
const ESCAPE: u8 = 0xFF;

/// One tuple element.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Element {
    Str(String),
    Int(i64),
}

impl Element {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Element::Str(s) => Some(s),
            Element::Int(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Element::Int(i) => Some(*i),
            Element::Str(_) => None,
        }
    }
}

impl From<&str> for Element {
    fn from(s: &str) -> Self {
        Element::Str(s.to_string())
    }
}

impl From<String> for Element {
    fn from(s: String) -> Self {
        Element::Str(s)
    }
}

impl From<i64> for Element {
    fn from(i: i64) -> Self {
        Element::Int(i)
    }
}

impl From<u32> for Element {
    fn from(i: u32) -> Self {
        Element::Int(i64::from(i))
    }
}

/// Encode a tuple.
pub fn pack(elements: &[Element]) -> Vec<u8> {
    let mut out = Vec::with_capacity(elements.len() * 8);
    for element in elements {
        match element {
            Element::Str(s) => {
                out.push(STRING_CODE);
                for &b in s.as_bytes() {
                    out.push(b);
                    if b == 0x00 {
                        out.push(ESCAPE);
                    }
                }
                out.push(0x00);
            }
            Element::Int(i) => pack_int(*i, &mut out),
        }
    }
    out
}

fn pack_int(value: i64, out: &mut Vec<u8>) {
    if value == 0 {
        out.push(INT_ZERO_CODE);
        return;
    }

    let magnitude = value.unsigned_abs();
    let len = byte_len(magnitude);
    let encoded = if value > 0 { magnitude } else { !magnitude };
    out.push(if value > 0 {
        INT_ZERO_CODE + len as u8
    } else {
        INT_ZERO_CODE - len as u8
    });
    out.extend_from_slice(&encoded.to_be_bytes()[8 - len..]);
}

fn byte_len(magnitude: u64) -> usize {
    8 - (magnitude.leading_zeros() as usize / 8)
}

/// Decode a tuple produced by [`pack`].
///
/// # Errors
/// - Unknown type code, truncated element, or integer out of range
pub fn unpack(bytes: &[u8]) -> Result<Vec<Element>> {
    let mut elements = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let code = bytes[pos];
        pos += 1;
        match code {
            STRING_CODE => {
                let mut buf = Vec::new();
                loop {
                    match bytes.get(pos) {
                        None => return Err(malformed("unterminated string")),
                        Some(0x00) if bytes.get(pos + 1) == Some(&ESCAPE) => {
                            buf.push(0x00);
                            pos += 2;
                        }
                        Some(0x00) => {
                            pos += 1;
                            break;
                        }
                        Some(&b) => {
                            buf.push(b);
                            pos += 1;
                        }
                    }
                }
                let s = String::from_utf8(buf).map_err(|_| malformed("string is not UTF-8"))?;
                elements.push(Element::Str(s));
            }
            0x0C..=0x1C => {
                let positive = code >= INT_ZERO_CODE;
                let len = code.abs_diff(INT_ZERO_CODE) as usize;
                let raw = bytes
                    .get(pos..pos + len)
                    .ok_or_else(|| malformed("truncated integer"))?;
                pos += len;

                let mut buf = [0u8; 8];
                buf[8 - len..].copy_from_slice(raw);
                let encoded = u64::from_be_bytes(buf);
                let value = if positive {
                    i64::try_from(encoded).map_err(|_| malformed("integer out of range"))?
                } else {
                    let mask = if len == 8 { u64::MAX } else { (1u64 << (len * 8)) - 1 };
                    let magnitude = !encoded & mask;
                    i64::try_from(-(i128::from(magnitude)))
                        .map_err(|_| malformed("integer out of range"))?
                };
                elements.push(Element::Int(value));
            }
            other => return Err(malformed(&format!("unknown type code {:#04x}", other))),
        }
    }

    Ok(elements)
}

/// Key range covering every tuple that extends `prefix`.
pub fn prefix_range(prefix: &[Element]) -> (Vec<u8>, Vec<u8>) {
    let packed = pack(prefix);
    let mut begin = packed.clone();
    begin.push(0x00);
    let mut end = packed;
    end.push(0xFF);
    (begin, end)
}

fn malformed(what: &str) -> Error {
    Error::Storage(format!("Malformed tuple key: {}", what))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_known_encodings() {
        assert_eq!(pack(&["rec".into()]), b"\x02rec\x00");
        assert_eq!(pack(&[Element::Int(0)]), vec![0x14]);
        assert_eq!(pack(&[Element::Int(1)]), vec![0x15, 0x01]);
        assert_eq!(pack(&[Element::Int(256)]), vec![0x16, 0x01, 0x00]);
        assert_eq!(pack(&[Element::Int(-1)]), vec![0x13, 0xFE]);
        assert_eq!(pack(&["a\0b".into()]), b"\x02a\x00\xFFb\x00");
    }

    #[test]
    fn test_extremes_roundtrip() {
        for v in [i64::MIN, i64::MIN + 1, -256, -255, 255, i64::MAX] {
            let packed = pack(&[Element::Int(v)]);
            assert_eq!(unpack(&packed).unwrap(), vec![Element::Int(v)]);
        }
    }

    #[test]
    fn test_malformed_rejected() {
        assert!(unpack(b"\x02abc").is_err());
        assert!(unpack(&[0x16, 0x01]).is_err());
        assert!(unpack(&[0x40]).is_err());
    }

    #[test]
    fn test_prefix_range_contains_children() {
        let (begin, end) = prefix_range(&["rec".into(), "10.25.1.1".into()]);
        let child = pack(&["rec".into(), "10.25.1.1".into(), "7".into(), "current".into()]);
        let sibling = pack(&["rec".into(), "10.25.1.10".into(), "7".into()]);

        assert!(begin < child && child < end);
        assert!(!(begin < sibling && sibling < end));
    }

    proptest! {
        #[test]
        fn ints_preserve_order(a in any::<i64>(), b in any::<i64>()) {
            let pa = pack(&[Element::Int(a)]);
            let pb = pack(&[Element::Int(b)]);
            prop_assert_eq!(a.cmp(&b), pa.cmp(&pb));
        }

        #[test]
        fn strings_preserve_order(a in "\\PC*", b in "\\PC*") {
            let pa = pack(&[a.clone().into(), Element::Int(1)]);
            let pb = pack(&[b.clone().into(), Element::Int(1)]);
            prop_assert_eq!(a.as_bytes().cmp(b.as_bytes()), pa.cmp(&pb));
        }

        #[test]
        fn unpack_inverts_pack(s in "[\\x00-\\x7f]{0,12}", i in any::<i64>()) {
            let tuple = vec![Element::Str(s), Element::Int(i)];
            prop_assert_eq!(unpack(&pack(&tuple)).unwrap(), tuple);
        }
    }
}
