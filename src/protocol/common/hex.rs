use num_traits::CheckedAdd;
use num_traits::CheckedMul;
use num_traits::FromPrimitive;
use num_traits::Zero;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeHexError {
    NotAscii,
    Empty,
    Overflow,
}

/// Decode a big-endian hex string into an integer.
pub fn decode_hex<I>(buf: &[u8]) -> Result<I, DecodeHexError>
where
    I: FromPrimitive + Zero + CheckedAdd + CheckedMul,
{
    use DecodeHexError::*;

    let radix = I::from_u8(16).ok_or(Overflow)?;

    if buf.is_empty() {
        return Err(Empty);
    }

    let mut result = I::zero();

    for &digit in buf.iter() {
        let x = I::from_u8(ascii2byte(digit).ok_or(NotAscii)?).ok_or(Overflow)?;
        result = result.checked_mul(&radix).ok_or(Overflow)?;
        result = result.checked_add(&x).ok_or(Overflow)?;
    }

    Ok(result)
}

fn ascii2byte(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeBufError {
    NotAscii,
    OddLen,
    UnexpectedEscape,
}

/// Decode a hex string into a byte slice _in place_.
pub fn decode_hex_buf(buf: &mut [u8]) -> Result<&mut [u8], DecodeBufError> {
    if buf.len() % 2 != 0 {
        return Err(DecodeBufError::OddLen);
    }

    let decoded_len = buf.len() / 2;
    for i in 0..decoded_len {
        let hi = ascii2byte(buf[i * 2]).ok_or(DecodeBufError::NotAscii)?;
        let lo = ascii2byte(buf[i * 2 + 1]).ok_or(DecodeBufError::NotAscii)?;
        buf[i] = hi << 4 | lo;
    }

    Ok(&mut buf[..decoded_len])
}

/// Decode a binary-escaped payload (as used by `X` and `vFlashWrite`)
/// _in place_, reversing the `}`-escape convention.
pub fn decode_bin_buf(buf: &mut [u8]) -> Result<&mut [u8], DecodeBufError> {
    let mut i = 0;
    let mut len = 0;

    while i < buf.len() {
        if buf[i] == b'}' {
            if i + 1 >= buf.len() {
                return Err(DecodeBufError::UnexpectedEscape);
            }
            buf[len] = buf[i + 1] ^ 0x20;
            i += 2;
        } else {
            buf[len] = buf[i];
            i += 1;
        }
        len += 1;
    }

    Ok(&mut buf[..len])
}

/// Encode a byte as two lowercase ASCII hex digits.
pub fn encode_hex_digits(byte: u8) -> [u8; 2] {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    [
        DIGITS[(byte >> 4) as usize],
        DIGITS[(byte & 0xf) as usize],
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_hex_values() {
        assert_eq!(decode_hex::<u32>(b"deadbeef"), Ok(0xdead_beef));
        assert_eq!(decode_hex::<u16>(b"0"), Ok(0));
        assert_eq!(decode_hex::<u8>(b"100"), Err(DecodeHexError::Overflow));
        assert_eq!(decode_hex::<u32>(b""), Err(DecodeHexError::Empty));
        assert_eq!(decode_hex::<u32>(b"12g4"), Err(DecodeHexError::NotAscii));
    }

    #[test]
    fn decode_hex_buf_in_place() {
        let mut buf = *b"48656c6c6f";
        assert_eq!(decode_hex_buf(&mut buf).unwrap(), b"Hello");

        let mut odd = *b"123";
        assert_eq!(decode_hex_buf(&mut odd), Err(DecodeBufError::OddLen));
    }

    #[test]
    fn decode_bin_unescapes() {
        let mut buf = *b"a}\x03b";
        assert_eq!(decode_bin_buf(&mut buf).unwrap(), b"a#b");

        let mut dangling = *b"abc}";
        assert_eq!(
            decode_bin_buf(&mut dangling),
            Err(DecodeBufError::UnexpectedEscape)
        );
    }

    #[test]
    fn encode_digits() {
        assert_eq!(encode_hex_digits(0x9a), *b"9a");
        assert_eq!(encode_hex_digits(0x05), *b"05");
    }
}
