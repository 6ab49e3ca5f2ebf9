use crate::protocol::common::hex::encode_hex_digits;

/// Builds a single outbound RSP frame into a caller-provided buffer,
/// accumulating the checksum and run-length compressing the payload on
/// the fly.
///
/// The finished frame stays in the buffer so the caller can retain it for
/// one retransmit round (a `-` from the client resends it verbatim).
pub(crate) struct ResponseWriter<'a> {
    buf: &'a mut Vec<u8>,
    checksum: u8,
    rle_char: u8,
    rle_repeat: u8,
}

impl<'a> ResponseWriter<'a> {
    pub fn new(buf: &'a mut Vec<u8>) -> Self {
        buf.clear();
        buf.push(b'$');
        Self {
            buf,
            checksum: 0,
            rle_char: 0,
            rle_repeat: 0,
        }
    }

    /// Consumes self, writing out the final `#` and checksum.
    pub fn finish(mut self) {
        self.flush_run();
        let checksum = self.checksum;
        self.buf.push(b'#');
        self.buf.extend_from_slice(&encode_hex_digits(checksum));
    }

    fn inner_write(&mut self, byte: u8) {
        self.checksum = self.checksum.wrapping_add(byte);
        self.buf.push(byte);
    }

    fn flush_run(&mut self) {
        loop {
            match self.rle_repeat {
                // happens once, before the first byte is written
                0 => {}
                // RLE doesn't win, just output the bytes
                1..=3 => {
                    for _ in 0..self.rle_repeat {
                        self.inner_write(self.rle_char)
                    }
                }
                n => {
                    // never emit '#', '$', '*', '+' or '-' as a count char
                    let count = 28 + n;
                    if matches!(count, b'#' | b'$' | b'*' | b'+' | b'-') {
                        self.inner_write(self.rle_char);
                        self.rle_repeat -= 1;
                        continue;
                    }
                    self.inner_write(self.rle_char);
                    self.inner_write(b'*');
                    self.inner_write(count);
                }
            }
            self.rle_repeat = 0;
            break;
        }
    }

    fn write(&mut self, byte: u8) {
        // a count char above '~' would not be printable
        let run_fits = 28 + (self.rle_repeat as u32 + 1) <= b'~' as u32;
        if byte == self.rle_char && self.rle_repeat != 0 && run_fits {
            self.rle_repeat += 1;
            return;
        }

        self.flush_run();
        self.rle_char = byte;
        self.rle_repeat = 1;
    }

    /// Write an entire string into the frame.
    pub fn write_str(&mut self, s: &str) {
        for &b in s.as_bytes() {
            self.write(b);
        }
    }

    /// Write a single byte as two ASCII hex digits.
    pub fn write_hex(&mut self, byte: u8) {
        for b in encode_hex_digits(byte).iter() {
            self.write(*b);
        }
    }

    /// Write a byte buffer as a hex string.
    pub fn write_hex_buf(&mut self, data: &[u8]) {
        for &b in data {
            self.write_hex(b);
        }
    }

    /// Write data using the binary escape convention.
    pub fn write_binary(&mut self, data: &[u8]) {
        for &b in data {
            match b {
                b'#' | b'$' | b'}' | b'*' => {
                    self.write(b'}');
                    self.write(b ^ 0x20);
                }
                _ => self.write(b),
            }
        }
    }

    /// Write a number as a big-endian hex string, trimming leading zero
    /// bytes.
    pub fn write_num(&mut self, digit: u64) {
        if digit == 0 {
            return self.write_hex(0);
        }

        for b in digit.to_be_bytes().iter().copied().skip_while(|&b| b == 0) {
            self.write_hex(b);
        }
    }

    /// Write a thread-id, using the RSP convention of `-1` for "all".
    pub fn write_tid(&mut self, tid: crate::common::Tid) {
        if tid == 0 {
            self.write_str("-1");
        } else {
            self.write_num(tid as u64);
        }
    }
}
