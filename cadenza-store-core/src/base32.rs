// SPDX-License-Identifier: MIT

//! The store's base32 variant: lowercase, omitting `e o u t`, encoded
//! least-significant bits first.

use thiserror::Error;

// omitted: E O U T
const ALPHABET: &[u8] = b"0123456789abcdfghijklmnpqrsvwxyz";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid base32 character {c:?} at offset {at}", c = *.0 as char, at = .1)]
pub struct InvalidBase32(pub u8, pub usize);

/// Length of the encoding of `n` bytes.
pub const fn encoded_len(n: usize) -> usize {
    if n == 0 { 0 } else { (n * 8 - 1) / 5 + 1 }
}

pub fn encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(encoded_len(bytes.len()));
    for n in (0..encoded_len(bytes.len())).rev() {
        let b = n * 5;
        let (i, j) = (b / 8, b % 8);
        let lo = bytes[i] >> j;
        let hi = if i + 1 < bytes.len() {
            bytes[i + 1].checked_shl((8 - j) as u32).unwrap_or(0)
        } else {
            0
        };
        out.push(ALPHABET[((lo | hi) & 0x1f) as usize] as char);
    }
    out
}

pub fn decode(input: &str) -> Result<Vec<u8>, InvalidBase32> {
    let bytes = input.as_bytes();
    let out_len = bytes.len() * 5 / 8;
    let mut out = vec![0u8; out_len];
    for (n, &c) in bytes.iter().rev().enumerate() {
        let digit = ALPHABET
            .iter()
            .position(|&a| a == c)
            .ok_or(InvalidBase32(c, bytes.len() - 1 - n))? as u8;
        let b = n * 5;
        let (i, j) = (b / 8, b % 8);
        if i < out_len {
            out[i] |= digit << j;
            if i + 1 < out_len && j > 3 {
                out[i + 1] |= digit >> (8 - j);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(b"", "")]
    #[case(b"\x1f", "0z")]
    #[case(
        b"\xb9\x4d\x27\xb9\x93\x4d\x3e\x08\xa5\x2e\x52\xd7\xda\x7d\xab\xfa\xc4\x84\xef\xe3\x7a\x53\x80\xee\x90\x88\xf7\xac\xe2\xef\xcd\xe9",
        "1sfdxziarxw8j3p80lvswgpq9i7smdyxmmsj5sjhhgjdjfwjfkdr"
    )]
    fn encode_known(#[case] data: &[u8], #[case] expected: &str) {
        assert_eq!(encode(data), expected);
    }

    #[rstest]
    #[case(&[0u8; 20])]
    #[case(b"hello world")]
    #[case(&[0xff; 32])]
    fn roundtrip(#[case] data: &[u8]) {
        assert_eq!(decode(&encode(data)).unwrap(), data);
    }

    #[test]
    fn rejects_bad_character() {
        assert!(decode("te").is_err());
    }
}
