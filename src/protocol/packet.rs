use crate::protocol::common::hex::decode_hex;
use crate::protocol::GDB_BUF_LEN;

/// Packet parse error.
#[derive(Debug, PartialEq, Eq)]
pub enum PacketParseError {
    ChecksumMismatched { checksum: u8, calculated: u8 },
    EmptyBuf,
    MissingChecksum,
    MalformedChecksum,
    TruncatedRle,
    Overflow,
    UnexpectedHeader(u8),
}

/// Top-level GDB packet.
///
/// A single `+` / `-` / `\x03` byte outside a frame is a packet of its
/// own; everything else arrives as a `$<payload>#<cc>` frame.
pub enum Packet<'a> {
    Ack,
    Nack,
    Interrupt,
    Command(&'a mut [u8]),
}

impl<'a> Packet<'a> {
    /// Validate and decode a raw packet buffer.
    ///
    /// On success the buffer holds the decoded (RLE-expanded) payload and
    /// the returned [`Packet::Command`] borrows it. Checksum validation
    /// happens on the wire encoding, before RLE expansion.
    pub fn from_buf(buf: &'a mut Vec<u8>) -> Result<Packet<'a>, PacketParseError> {
        match *buf.first().ok_or(PacketParseError::EmptyBuf)? {
            b'+' => Ok(Packet::Ack),
            b'-' => Ok(Packet::Nack),
            0x03 => Ok(Packet::Interrupt),
            b'$' => {
                let body = parse_frame(buf)?;
                Ok(Packet::Command(&mut buf[body.0..body.1]))
            }
            header => Err(PacketParseError::UnexpectedHeader(header)),
        }
    }
}

/// Strip the `$...#cc` framing, verify the checksum, and expand any
/// run-length encoding in place. Returns the body's range within `buf`.
fn parse_frame(buf: &mut Vec<u8>) -> Result<(usize, usize), PacketParseError> {
    let hash = buf
        .iter()
        .position(|&b| b == b'#')
        .ok_or(PacketParseError::MissingChecksum)?;

    let checksum = buf
        .get(hash + 1..hash + 3)
        .ok_or(PacketParseError::MalformedChecksum)?;
    let checksum: u8 =
        decode_hex(checksum).map_err(|_| PacketParseError::MalformedChecksum)?;

    let calculated = buf[1..hash].iter().fold(0u8, |a, &x| a.wrapping_add(x));
    if calculated != checksum {
        return Err(PacketParseError::ChecksumMismatched {
            checksum,
            calculated,
        });
    }

    // `X` payloads are 8-bit binary: a raw `*` in them is data, not a
    // run-length marker (clients only escape `#`, `$` and `}`)
    let binary_payload = buf[1] == b'X';

    if binary_payload || !buf[1..hash].contains(&b'*') {
        return Ok((1, hash));
    }

    // Expand `<byte>*<count>` runs. The count character encodes 29 fewer
    // repetitions than its ASCII value.
    let mut decoded = Vec::with_capacity(hash - 1);
    let mut i = 1;
    while i < hash {
        let b = buf[i];
        if b == b'*' {
            let &prev = decoded.last().ok_or(PacketParseError::TruncatedRle)?;
            let count = *buf.get(i + 1).filter(|_| i + 1 < hash).ok_or(PacketParseError::TruncatedRle)?;
            let n = count.checked_sub(29).ok_or(PacketParseError::TruncatedRle)?;
            for _ in 0..n {
                decoded.push(prev);
            }
            i += 2;
        } else {
            decoded.push(b);
            i += 1;
        }
    }

    if decoded.len() > GDB_BUF_LEN {
        return Err(PacketParseError::Overflow);
    }

    buf.truncate(1);
    buf.extend_from_slice(&decoded);
    let len = buf.len();
    Ok((1, len))
}
