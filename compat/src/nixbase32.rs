//! The "base32" variant used for store path digests and printed hashes.
//!
//! It uses its own alphabet (no `e`, `o`, `u`, `t`), emits no padding, and
//! walks the input from the last 5-bit group to the first, so the output
//! can't be produced by an RFC4648 encoder.

use thiserror::Error;

const ALPHABET: &[u8; 32] = b"0123456789abcdfghijklmnpqrsvwxyz";

/// Errors that can occur while decoding nixbase32-encoded data.
#[derive(Debug, Eq, PartialEq, Error)]
pub enum Nixbase32DecodeError {
    #[error("character {0:x} not in alphabet")]
    CharacterNotInAlphabet(u8),
    #[error("nonzero carry")]
    NonzeroCarry,
    #[error("invalid length {0}, expected {1}")]
    InvalidLength(usize, usize),
}

/// Encodes the given bytes.
pub fn encode(input: &[u8]) -> String {
    let output_len = encode_len(input.len());
    let mut output = String::with_capacity(output_len);

    for n in (0..output_len).rev() {
        let b = n * 5;
        let i = b / 8;
        let j = b % 8;

        let mut c = input[i] >> j;
        if i + 1 < input.len() {
            // shift in u16, so the bits shifted out are discarded without panicking.
            c |= ((input[i + 1] as u16) << (8 - j as u16)) as u8
        }

        output.push(ALPHABET[(c & 0x1f) as usize] as char);
    }

    output
}

/// Maps an encoded character to its 5-bit value, its index in the alphabet.
fn decode_char(encoded_char: u8) -> Option<u8> {
    Some(match encoded_char {
        b'0'..=b'9' => encoded_char - b'0',
        b'a'..=b'd' => encoded_char - b'a' + 10_u8,
        b'f'..=b'n' => encoded_char - b'f' + 14_u8,
        b'p'..=b's' => encoded_char - b'p' + 23_u8,
        b'v'..=b'z' => encoded_char - b'v' + 27_u8,
        _ => return None,
    })
}

/// Decodes the given input.
pub fn decode(input: impl AsRef<[u8]>) -> Result<Vec<u8>, Nixbase32DecodeError> {
    let input = input.as_ref();
    let output_len = decode_len(input.len());
    let mut output: Vec<u8> = vec![0x00; output_len];

    for (n, c) in input.iter().rev().enumerate() {
        let c_decoded =
            decode_char(*c).ok_or(Nixbase32DecodeError::CharacterNotInAlphabet(*c))?;

        let b = n * 5;
        let i = b / 8;
        let j = b % 8;

        let val = (c_decoded as u16).rotate_left(j as u32);
        let carry = ((val & 0xff00) >> 8) as u8;

        if i == output_len {
            // only bits that fall off the end are left, they need to be zero.
            if val != 0 {
                return Err(Nixbase32DecodeError::NonzeroCarry);
            }
            continue;
        }

        output[i] |= (val & 0x00ff) as u8;

        if i == output_len - 1 {
            if carry != 0 {
                return Err(Nixbase32DecodeError::NonzeroCarry);
            }
        } else {
            output[i + 1] |= carry;
        }
    }

    Ok(output)
}

/// Decodes into a fixed-size array, failing if the encoded length doesn't
/// correspond to exactly `N` bytes.
pub fn decode_fixed<const N: usize>(
    input: impl AsRef<[u8]>,
) -> Result<[u8; N], Nixbase32DecodeError> {
    let input = input.as_ref();
    if input.len() != encode_len(N) {
        return Err(Nixbase32DecodeError::InvalidLength(
            input.len(),
            encode_len(N),
        ));
    }

    let mut output = [0u8; N];
    output.copy_from_slice(&decode(input)?);
    Ok(output)
}

/// Returns the decoded length of an input of length len.
pub const fn decode_len(len: usize) -> usize {
    (len * 5) / 8
}

/// Returns the encoded length of an input of length len
pub const fn encode_len(len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    (len * 8 - 1) / 5 + 1
}
