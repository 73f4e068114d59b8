//! # RESP2 Encoding and Incremental Decoding
//!
//! Purpose: Encode client commands and decode server replies straight out of
//! a socket read buffer, without knowing in advance how many bytes a frame
//! spans.
//!
//! ## Design Principles
//! 1. **Scan, Then Build**: A resumable header scan proves a frame complete
//!    before any value is built; nothing is consumed until then.
//! 2. **Buffer Reuse**: Callers own the `BytesMut` buffers on both sides, and
//!    decoded payloads share the read buffer's allocation.
//! 3. **Binary-Safe**: Bulk strings are treated as raw bytes.
//! 4. **Fail Fast**: Invalid framing returns protocol errors immediately.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, ProtocolResult};

/// Largest bulk string accepted by default (512 MiB, the Redis proto limit).
pub const DEFAULT_MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// RESP2 value as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// +OK or +PONG style responses.
    Simple(Bytes),
    /// -ERR ... responses.
    Error(Bytes),
    /// :123 responses.
    Integer(i64),
    /// $... bulk strings, with None for null.
    Bulk(Option<Bytes>),
    /// *... arrays, with None for the null array.
    Array(Option<Vec<RespValue>>),
}

/// Encodes a RESP2 array command into the provided buffer.
pub fn encode_command<A: AsRef<[u8]>>(args: &[A], out: &mut BytesMut) {
    out.put_u8(b'*');
    push_usize(out, args.len());
    out.put_slice(b"\r\n");
    for arg in args {
        let arg = arg.as_ref();
        out.put_u8(b'$');
        push_usize(out, arg.len());
        out.put_slice(b"\r\n");
        out.put_slice(arg);
        out.put_slice(b"\r\n");
    }
}

/// Incremental RESP2 decoder.
///
/// `decode` either consumes exactly one complete frame from the front of the
/// buffer or leaves the buffer untouched and returns `Ok(None)`. Progress on a
/// partial frame is remembered, so each call only scans newly arrived bytes.
/// Between calls that return `Ok(None)` the buffer may only grow at the back.
#[derive(Debug, Clone)]
pub struct RespDecoder {
    max_bulk_len: usize,
    scan: Scan,
}

/// Resume point of the completeness scan over a partial frame.
#[derive(Debug, Clone, Default)]
struct Scan {
    // Bytes at the front of the frame already known to be well formed.
    offset: usize,
    // Elements still owed by each open array, innermost last.
    open: Vec<usize>,
}

impl Default for RespDecoder {
    fn default() -> Self {
        RespDecoder::new()
    }
}

impl RespDecoder {
    /// Creates a decoder with the default bulk length limit.
    pub fn new() -> Self {
        RespDecoder::with_max_bulk_len(DEFAULT_MAX_BULK_LEN)
    }

    /// Creates a decoder that rejects bulk strings longer than `max_bulk_len`.
    pub fn with_max_bulk_len(max_bulk_len: usize) -> Self {
        RespDecoder {
            max_bulk_len,
            scan: Scan::default(),
        }
    }

    /// Decodes one frame from `buf`, advancing past it on success.
    pub fn decode(&mut self, buf: &mut BytesMut) -> ProtocolResult<Option<RespValue>> {
        let len = match self.scan_frame(&buf[..]) {
            Ok(Some(len)) => len,
            Ok(None) => return Ok(None),
            Err(err) => {
                self.scan = Scan::default();
                return Err(err);
            }
        };
        self.scan = Scan::default();

        // Payloads are slices of the frozen frame, not copies.
        let frame = buf.split_to(len).freeze();
        let (value, _) = materialize(&frame, 0)?;
        Ok(Some(value))
    }

    /// Walks frame headers from the saved offset; returns the frame length
    /// once the outermost value is complete.
    fn scan_frame(&mut self, data: &[u8]) -> ProtocolResult<Option<usize>> {
        loop {
            let (line, next) = match read_line(data, self.scan.offset)? {
                Some(found) => found,
                None => return Ok(None),
            };
            let (&kind, rest) = line.split_first().ok_or(ProtocolError::EmptyLine)?;

            let complete = match kind {
                b'+' | b'-' => {
                    self.scan.offset = next;
                    true
                }
                b':' => {
                    parse_i64(rest)?;
                    self.scan.offset = next;
                    true
                }
                b'$' => {
                    let len = parse_i64(rest)?;
                    if len < 0 {
                        self.scan.offset = next;
                    } else {
                        let end = next + self.check_bulk_len(len)?;
                        if data.len() < end + 2 {
                            // Offset stays on the header; it is re-read next time.
                            return Ok(None);
                        }
                        if &data[end..end + 2] != b"\r\n" {
                            return Err(ProtocolError::MissingCrlf);
                        }
                        self.scan.offset = end + 2;
                    }
                    true
                }
                b'*' => {
                    let len = parse_i64(rest)?;
                    self.scan.offset = next;
                    if len > 0 {
                        self.scan.open.push(len as usize);
                        false
                    } else {
                        true
                    }
                }
                other => return Err(ProtocolError::UnknownType(other)),
            };

            if complete && self.close_element() {
                return Ok(Some(self.scan.offset));
            }
        }
    }

    /// Marks one element finished; true when no array is left open.
    fn close_element(&mut self) -> bool {
        while let Some(owed) = self.scan.open.last_mut() {
            *owed -= 1;
            if *owed > 0 {
                return false;
            }
            self.scan.open.pop();
        }
        true
    }

    fn check_bulk_len(&self, len: i64) -> ProtocolResult<usize> {
        let len = len as usize;
        if len > self.max_bulk_len {
            return Err(ProtocolError::BulkTooLarge {
                len,
                max: self.max_bulk_len,
            });
        }
        Ok(len)
    }
}

/// Builds the value of a frame that `scan_frame` already validated.
fn materialize(frame: &Bytes, pos: usize) -> ProtocolResult<(RespValue, usize)> {
    let (line, next) = read_line(frame, pos)?.ok_or(ProtocolError::MissingCrlf)?;
    let (&kind, rest) = line.split_first().ok_or(ProtocolError::EmptyLine)?;
    let text = pos + 1..next - 2;

    match kind {
        b'+' => Ok((RespValue::Simple(frame.slice(text)), next)),
        b'-' => Ok((RespValue::Error(frame.slice(text)), next)),
        b':' => Ok((RespValue::Integer(parse_i64(rest)?), next)),
        b'$' => {
            let len = parse_i64(rest)?;
            if len < 0 {
                return Ok((RespValue::Bulk(None), next));
            }
            let end = next + len as usize;
            Ok((RespValue::Bulk(Some(frame.slice(next..end))), end + 2))
        }
        b'*' => {
            let len = parse_i64(rest)?;
            if len < 0 {
                return Ok((RespValue::Array(None), next));
            }
            // Cap the preallocation; the count comes from the peer.
            let mut items = Vec::with_capacity((len as usize).min(1024));
            let mut cursor = next;
            for _ in 0..len {
                let (item, after) = materialize(frame, cursor)?;
                items.push(item);
                cursor = after;
            }
            Ok((RespValue::Array(Some(items)), cursor))
        }
        other => Err(ProtocolError::UnknownType(other)),
    }
}

/// Returns the line starting at `pos` (without CRLF) and the offset after it.
fn read_line(data: &[u8], pos: usize) -> ProtocolResult<Option<(&[u8], usize)>> {
    let newline = match data[pos..].iter().position(|&b| b == b'\n') {
        Some(offset) => pos + offset,
        None => return Ok(None),
    };
    if newline == pos || data[newline - 1] != b'\r' {
        return Err(ProtocolError::MissingCrlf);
    }
    Ok(Some((&data[pos..newline - 1], newline + 1)))
}

fn parse_i64(data: &[u8]) -> ProtocolResult<i64> {
    let (negative, digits) = match data.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, data),
    };
    if digits.is_empty() {
        return Err(ProtocolError::InvalidInteger);
    }

    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(ProtocolError::InvalidInteger);
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as i64);
    }

    if negative {
        Ok(-value)
    } else {
        Ok(value)
    }
}

fn push_usize(out: &mut BytesMut, mut value: usize) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    for idx in (0..len).rev() {
        out.put_u8(buf[idx]);
    }
}
