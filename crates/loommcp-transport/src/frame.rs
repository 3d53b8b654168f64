//! Message framing codecs.
//!
//! TCP frames are a 4-byte big-endian length prefix followed by that many
//! bytes of JSON; announced lengths outside `[1, max]` are framing
//! violations that close the connection. The stdio transport frames one
//! JSON message per line instead.
//!
//! Readers run against sockets configured with short read timeouts: a
//! timeout with nothing read surfaces as `WouldBlock` so the caller can
//! check its stop flag, while a timeout mid-frame just keeps reading (the
//! stop flag still aborts it).

use std::io::{BufRead, ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use loommcp_core::Arena;

use crate::error::{TransportError, TransportResult};

/// Bytes in the length prefix.
pub const LENGTH_PREFIX_BYTES: usize = 4;

/// One read attempt against a frame decoder, borrowing arena scratch.
#[derive(Debug)]
pub enum FrameOutcome<'a> {
    /// A complete payload, valid until the arena is reset.
    Frame(&'a [u8]),
    /// Nothing available before the read timeout; check the stop flag.
    WouldBlock,
    /// Clean end of stream.
    Closed,
}

/// One read attempt against the line decoder.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A complete payload.
    Frame(Vec<u8>),
    /// Nothing available before the read timeout; check the stop flag.
    WouldBlock,
    /// Clean end of stream.
    Closed,
}

enum Fill {
    Full,
    Empty,
    Closed,
}

/// Read exactly `buf.len()` bytes, tolerating read timeouts.
///
/// A timeout before the first byte returns [`Fill::Empty`]; afterwards the
/// read continues until complete, EOF (an error mid-frame), or the stop
/// flag is raised.
fn fill(reader: &mut impl Read, buf: &mut [u8], stop: &AtomicBool) -> TransportResult<Fill> {
    let mut filled = 0usize;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return if filled == 0 {
                    Ok(Fill::Closed)
                } else {
                    Err(TransportError::ConnectionLost(
                        "connection closed mid-frame".into(),
                    ))
                };
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                if filled == 0 {
                    return Ok(Fill::Empty);
                }
                if stop.load(Ordering::Acquire) {
                    return Err(TransportError::Stopped);
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Fill::Full)
}

/// Decode one length-prefixed frame into arena scratch.
///
/// # Errors
///
/// Framing violations (zero or oversized length), mid-frame EOF, stop
/// requests, and I/O failures. All of them mean the connection must close.
pub fn read_frame_into<'a>(
    reader: &mut impl Read,
    max: usize,
    stop: &AtomicBool,
    arena: &'a mut Arena,
) -> TransportResult<FrameOutcome<'a>> {
    let mut header = [0u8; LENGTH_PREFIX_BYTES];
    match fill(reader, &mut header, stop)? {
        Fill::Empty => return Ok(FrameOutcome::WouldBlock),
        Fill::Closed => return Ok(FrameOutcome::Closed),
        Fill::Full => {}
    }

    let len = u32::from_be_bytes(header) as usize;
    if len == 0 {
        return Err(TransportError::FramingViolation("zero-length frame".into()));
    }
    if len > max {
        return Err(TransportError::MessageTooLarge { size: len, max });
    }

    let payload = arena.alloc(len);
    loop {
        match fill(reader, payload, stop)? {
            Fill::Full => break,
            Fill::Empty => {
                // Header arrived but the body has not; keep waiting unless
                // asked to stop.
                if stop.load(Ordering::Acquire) {
                    return Err(TransportError::Stopped);
                }
            }
            Fill::Closed => {
                return Err(TransportError::ConnectionLost(
                    "connection closed mid-frame".into(),
                ));
            }
        }
    }
    Ok(FrameOutcome::Frame(payload))
}

/// Encode one frame to a writer.
///
/// # Errors
///
/// Rejects empty or oversized payloads; propagates write failures.
pub fn write_frame(writer: &mut impl Write, payload: &[u8], max: usize) -> TransportResult<()> {
    if payload.is_empty() {
        return Err(TransportError::FramingViolation("zero-length frame".into()));
    }
    if payload.len() > max {
        return Err(TransportError::MessageTooLarge {
            size: payload.len(),
            max,
        });
    }
    let header = (payload.len() as u32).to_be_bytes();
    writer.write_all(&header)?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Encode one frame to a fresh buffer. Pure counterpart of
/// [`write_frame`], handy for tests and vectored sends.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LENGTH_PREFIX_BYTES + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Decode one frame from a byte slice.
///
/// Returns the payload and the number of bytes consumed, or `None` when the
/// slice does not yet hold a complete frame.
///
/// # Errors
///
/// Framing violations as in [`read_frame_into`].
pub fn decode_frame(bytes: &[u8], max: usize) -> TransportResult<Option<(Vec<u8>, usize)>> {
    if bytes.len() < LENGTH_PREFIX_BYTES {
        return Ok(None);
    }
    let mut header = [0u8; LENGTH_PREFIX_BYTES];
    header.copy_from_slice(&bytes[..LENGTH_PREFIX_BYTES]);
    let len = u32::from_be_bytes(header) as usize;
    if len == 0 {
        return Err(TransportError::FramingViolation("zero-length frame".into()));
    }
    if len > max {
        return Err(TransportError::MessageTooLarge { size: len, max });
    }
    let end = LENGTH_PREFIX_BYTES + len;
    if bytes.len() < end {
        return Ok(None);
    }
    Ok(Some((bytes[LENGTH_PREFIX_BYTES..end].to_vec(), end)))
}

/// Decode one newline-delimited message, the stdio framing.
///
/// # Errors
///
/// Oversized lines and I/O failures; both close the stream.
pub fn read_line_frame(
    reader: &mut impl BufRead,
    max: usize,
    stop: &AtomicBool,
) -> TransportResult<ReadOutcome> {
    let mut line = String::new();
    loop {
        match reader.read_line(&mut line) {
            Ok(0) => {
                return if line.is_empty() {
                    Ok(ReadOutcome::Closed)
                } else {
                    Err(TransportError::ConnectionLost(
                        "stream closed mid-line".into(),
                    ))
                };
            }
            Ok(_) => {
                if line.ends_with('\n') {
                    let trimmed = line.trim_end_matches(['\n', '\r']);
                    if trimmed.is_empty() {
                        line.clear();
                        continue;
                    }
                    if trimmed.len() > max {
                        return Err(TransportError::MessageTooLarge {
                            size: trimmed.len(),
                            max,
                        });
                    }
                    return Ok(ReadOutcome::Frame(trimmed.as_bytes().to_vec()));
                }
                if line.len() > max {
                    return Err(TransportError::MessageTooLarge {
                        size: line.len(),
                        max,
                    });
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                if line.is_empty() {
                    return Ok(ReadOutcome::WouldBlock);
                }
                if stop.load(Ordering::Acquire) {
                    return Err(TransportError::Stopped);
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const MAX: usize = 64;

    fn no_stop() -> AtomicBool {
        AtomicBool::new(false)
    }

    #[test]
    fn encode_decode_round_trip() {
        let payload = br#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#;
        let framed = encode_frame(payload);
        let (decoded, consumed) = decode_frame(&framed, MAX).unwrap().unwrap();
        assert_eq!(decoded, payload);
        assert_eq!(consumed, framed.len());
        // decode . encode is the identity on well-formed frames too.
        assert_eq!(encode_frame(&decoded), framed);
    }

    #[test]
    fn read_frame_from_stream() {
        let framed = encode_frame(b"hello");
        let mut reader = Cursor::new(framed);
        let mut arena = Arena::new();
        let stop = no_stop();
        match read_frame_into(&mut reader, MAX, &stop, &mut arena).unwrap() {
            FrameOutcome::Frame(payload) => assert_eq!(payload, b"hello"),
            other => panic!("expected frame, got {other:?}"),
        }
        // The stream is exhausted: clean close.
        assert!(matches!(
            read_frame_into(&mut reader, MAX, &stop, &mut arena).unwrap(),
            FrameOutcome::Closed
        ));
    }

    #[test]
    fn boundary_lengths() {
        // L = 1 is the smallest legal frame.
        let one = encode_frame(b"x");
        assert_eq!(decode_frame(&one, MAX).unwrap().unwrap().0, b"x");

        // L = max is accepted.
        let at_max = encode_frame(&vec![b'a'; MAX]);
        assert!(decode_frame(&at_max, MAX).unwrap().is_some());

        // L = max + 1 is rejected.
        let over = encode_frame(&vec![b'a'; MAX + 1]);
        assert!(matches!(
            decode_frame(&over, MAX),
            Err(TransportError::MessageTooLarge { .. })
        ));

        // L = 0 is rejected.
        let zero = 0u32.to_be_bytes().to_vec();
        assert!(matches!(
            decode_frame(&zero, MAX),
            Err(TransportError::FramingViolation(_))
        ));
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let mut framed = encode_frame(b"truncated");
        framed.truncate(framed.len() - 3);
        let mut reader = Cursor::new(framed);
        let mut arena = Arena::new();
        let stop = no_stop();
        assert!(matches!(
            read_frame_into(&mut reader, MAX, &stop, &mut arena),
            Err(TransportError::ConnectionLost(_))
        ));
    }

    #[test]
    fn partial_decode_asks_for_more() {
        let framed = encode_frame(b"abcdef");
        assert!(decode_frame(&framed[..3], MAX).unwrap().is_none());
        assert!(decode_frame(&framed[..7], MAX).unwrap().is_none());
    }

    #[test]
    fn write_frame_matches_encode() {
        let mut out = Vec::new();
        write_frame(&mut out, b"payload", MAX).unwrap();
        assert_eq!(out, encode_frame(b"payload"));
    }

    #[test]
    fn write_rejects_oversize_and_empty() {
        let mut out = Vec::new();
        assert!(matches!(
            write_frame(&mut out, &vec![0u8; MAX + 1], MAX),
            Err(TransportError::MessageTooLarge { .. })
        ));
        assert!(matches!(
            write_frame(&mut out, b"", MAX),
            Err(TransportError::FramingViolation(_))
        ));
    }

    #[test]
    fn line_frames() {
        let stop = no_stop();
        let mut reader = Cursor::new(b"{\"a\":1}\n\n{\"b\":2}\r\n".to_vec());
        assert_eq!(
            read_line_frame(&mut reader, MAX, &stop).unwrap(),
            ReadOutcome::Frame(b"{\"a\":1}".to_vec())
        );
        // Blank lines are skipped, carriage returns stripped.
        assert_eq!(
            read_line_frame(&mut reader, MAX, &stop).unwrap(),
            ReadOutcome::Frame(b"{\"b\":2}".to_vec())
        );
        assert_eq!(read_line_frame(&mut reader, MAX, &stop).unwrap(), ReadOutcome::Closed);
    }

    #[test]
    fn oversized_line_is_rejected() {
        let stop = no_stop();
        let long = format!("{}\n", "x".repeat(MAX + 1));
        let mut reader = Cursor::new(long.into_bytes());
        assert!(matches!(
            read_line_frame(&mut reader, MAX, &stop),
            Err(TransportError::MessageTooLarge { .. })
        ));
    }
}
