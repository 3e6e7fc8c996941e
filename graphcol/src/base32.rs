//! Crockford base32, restricted to the 128-bit values used by transaction
//! ids.
//!
//! A 128-bit value is written as 26 characters of 5 bits each, with the
//! two excess high bits required to be zero. Contrary to RFC4648-style
//! encodings the bit groups are right-aligned, which is why this can't be
//! expressed as a `data_encoding::Specification` - those pad at the end of
//! the bit stream, not the front.
//!
//! Decoding folds lowercase to uppercase and accepts the Crockford aliases
//! `I`/`L` for `1` and `O` for `0`.

use thiserror::Error;

const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Characters in the encoded form of a 128-bit value.
pub const ENCODED_LEN: usize = 26;

/// Errors that can occur while decoding Crockford base32 data.
#[derive(Debug, Eq, PartialEq, Error)]
pub enum Base32DecodeError {
    #[error("expected {ENCODED_LEN} characters, got {0}")]
    WrongLength(usize),
    #[error("character {0:?} not in alphabet")]
    CharacterNotInAlphabet(char),
    #[error("encoded value exceeds 128 bits")]
    Overflow,
}

/// Returns the 26-character encoding of `v`.
pub fn encode_u128(v: u128) -> String {
    let mut out = [0u8; ENCODED_LEN];
    for (i, slot) in out.iter_mut().rev().enumerate() {
        *slot = ALPHABET[((v >> (5 * i)) & 0x1f) as usize];
    }
    // The alphabet is ASCII.
    String::from_utf8(out.to_vec()).unwrap()
}

/// Maps an encoded character to its 5-bit value, honouring the Crockford
/// aliases.
fn decode_char(c: u8) -> Option<u8> {
    Some(match c.to_ascii_uppercase() {
        b'0' | b'O' => 0,
        b'1' | b'I' | b'L' => 1,
        c @ b'2'..=b'9' => c - b'0',
        c @ b'A'..=b'H' => c - b'A' + 10,
        c @ b'J'..=b'K' => c - b'J' + 18,
        c @ b'M'..=b'N' => c - b'M' + 20,
        c @ b'P'..=b'T' => c - b'P' + 22,
        c @ b'V'..=b'Z' => c - b'V' + 27,
        _ => return None,
    })
}

/// Decodes a 26-character Crockford string back into its 128-bit value.
pub fn decode_u128(input: &str) -> Result<u128, Base32DecodeError> {
    if input.len() != ENCODED_LEN {
        return Err(Base32DecodeError::WrongLength(input.len()));
    }

    let mut value: u128 = 0;
    for (i, c) in input.bytes().enumerate() {
        let bits =
            decode_char(c).ok_or(Base32DecodeError::CharacterNotInAlphabet(c as char))?;
        // 26 characters carry 130 bits; the first may only use three of its
        // five, or the value would not fit back into a u128.
        if i == 0 && bits > 7 {
            return Err(Base32DecodeError::Overflow);
        }
        value = (value << 5) | bits as u128;
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    #[test_case(0, "00000000000000000000000000"; "zero")]
    #[test_case(1, "00000000000000000000000001"; "one")]
    #[test_case(31, "0000000000000000000000000Z"; "one digit")]
    #[test_case(32, "00000000000000000000000010"; "carry")]
    #[test_case(u128::MAX, "7ZZZZZZZZZZZZZZZZZZZZZZZZZ"; "max")]
    fn roundtrip(v: u128, encoded: &str) {
        assert_eq!(encoded, super::encode_u128(v));
        assert_eq!(v, super::decode_u128(encoded).unwrap());
    }

    #[test]
    fn decode_aliases_and_case() {
        assert_eq!(
            super::decode_u128("0000000000000000000000000o").unwrap(),
            0
        );
        assert_eq!(
            super::decode_u128("0000000000000000000000000i").unwrap(),
            1
        );
        assert_eq!(
            super::decode_u128("0000000000000000000000000L").unwrap(),
            1
        );
        assert_eq!(
            super::decode_u128("7zzzzzzzzzzzzzzzzzzzzzzzzz").unwrap(),
            u128::MAX
        );
    }

    #[test]
    fn decode_rejects() {
        assert_eq!(
            super::decode_u128("too-short"),
            Err(super::Base32DecodeError::WrongLength(9))
        );
        assert_eq!(
            super::decode_u128("U0000000000000000000000000"),
            Err(super::Base32DecodeError::CharacterNotInAlphabet('U'))
        );
        // '8' in the leading position needs more than three bits.
        assert_eq!(
            super::decode_u128("80000000000000000000000000"),
            Err(super::Base32DecodeError::Overflow)
        );
    }
}
