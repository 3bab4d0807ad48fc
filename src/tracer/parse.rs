//! Event parsing for raw BPF ring buffer samples.
//!
//! Decodes byte slices from the ring buffer into typed [`BlockEvent`] values.
//! Length checks happen once per payload, then fixed-width reads use
//! unaligned loads.

use thiserror::Error;

use super::event::{
    BlockEvent, Comm, Completion, Device, Direction, EventKind, ProcessContext, RequestId,
    COMM_LEN,
};

/// Event header size in bytes (matches `struct event_header` in iomigrater.bpf.c).
pub const HEADER_SIZE: usize = 24;

/// Attribution payload: pid, ok flag, pad, comm.
pub const ATTRIBUTION_PAYLOAD: usize = 8 + COMM_LEN;

/// Completion payload: bytes, rwflag, pad, major, minor.
pub const COMPLETION_PAYLOAD: usize = 16;

/// Errors that can occur during event parsing.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("event too short: {size} bytes")]
    Truncated { size: usize },

    #[error("unknown event kind: {raw}")]
    UnknownEventKind { raw: u8 },

    #[error("reading {event_name}: unexpected end of data")]
    PayloadTruncated { event_name: &'static str },

    #[error("reading {event_name}: invalid rwflag byte {raw}")]
    InvalidDirection { event_name: &'static str, raw: u8 },
}

impl ParseError {
    /// Short label for metrics.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Truncated { .. } => "truncated",
            Self::UnknownEventKind { .. } => "unknown_kind",
            Self::PayloadTruncated { .. } => "payload_truncated",
            Self::InvalidDirection { .. } => "invalid_direction",
        }
    }
}

/// Parse a raw ring buffer sample into a [`BlockEvent`].
pub fn parse_event(data: &[u8]) -> Result<BlockEvent, ParseError> {
    if data.len() < HEADER_SIZE {
        return Err(ParseError::Truncated { size: data.len() });
    }

    let ts_ns = read_u64_le(data, 0);
    let req = RequestId(read_u64_le(data, 8));
    let kind_raw = read_u8(data, 16);
    let kind = EventKind::from_u8(kind_raw).ok_or(ParseError::UnknownEventKind { raw: kind_raw })?;

    // Safety: `data.len() >= HEADER_SIZE` is checked at function entry.
    let payload = unsafe { data.get_unchecked(HEADER_SIZE..) };

    match kind {
        EventKind::Attribution => parse_attribution(req, payload),
        EventKind::Start => Ok(BlockEvent::Start { req, ts_ns }),
        EventKind::Completion => parse_completion(req, ts_ns, payload),
    }
}

// ---------------------------------------------------------------------------
// Byte-reading helpers
// ---------------------------------------------------------------------------

#[inline(always)]
fn read_u8(data: &[u8], offset: usize) -> u8 {
    debug_assert!(offset < data.len());
    // Safety: callers verify payload lengths before reading fixed offsets.
    unsafe { *data.as_ptr().add(offset) }
}

#[inline(always)]
fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(read_fixed::<4>(data, offset))
}

#[inline(always)]
fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(read_fixed::<8>(data, offset))
}

#[inline(always)]
fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    debug_assert!(offset + N <= data.len());
    // Safety: callers ensure `offset + N <= data.len()` via upfront payload checks.
    unsafe { (data.as_ptr().add(offset) as *const [u8; N]).read_unaligned() }
}

fn ensure_payload(data: &[u8], need: usize, name: &'static str) -> Result<(), ParseError> {
    if data.len() < need {
        Err(ParseError::PayloadTruncated { event_name: name })
    } else {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-kind parsers
// ---------------------------------------------------------------------------

/// Attribution event: kind 1. Payload: 24 bytes.
///
/// `ok == 0` means `bpf_get_current_comm` failed in the kernel.
fn parse_attribution(req: RequestId, data: &[u8]) -> Result<BlockEvent, ParseError> {
    ensure_payload(data, ATTRIBUTION_PAYLOAD, "attribution event")?;

    let ok = read_u8(data, 4) != 0;
    let process = ok.then(|| {
        let comm: [u8; COMM_LEN] = read_fixed(data, 8);
        ProcessContext {
            pid: read_u32_le(data, 0),
            comm: Comm::from_bytes(&comm),
        }
    });

    Ok(BlockEvent::Attribution { req, process })
}

/// Completion event: kind 3. Payload: 16 bytes.
fn parse_completion(req: RequestId, ts_ns: u64, data: &[u8]) -> Result<BlockEvent, ParseError> {
    ensure_payload(data, COMPLETION_PAYLOAD, "completion event")?;

    let rw_raw = read_u8(data, 4);
    let direction = match rw_raw {
        0 => Direction::Read,
        1 => Direction::Write,
        raw => {
            return Err(ParseError::InvalidDirection {
                event_name: "completion event",
                raw,
            })
        }
    };

    Ok(BlockEvent::Completion(Completion {
        req,
        ts_ns,
        bytes: u64::from(read_u32_le(data, 0)),
        direction,
        // pad[3] at 5-7
        device: Device::new(read_u32_le(data, 8), read_u32_le(data, 12)),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(ts: u64, req: u64, kind: u8) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + ATTRIBUTION_PAYLOAD);
        buf.extend_from_slice(&ts.to_le_bytes());
        buf.extend_from_slice(&req.to_le_bytes());
        buf.push(kind);
        buf.extend_from_slice(&[0u8; 7]);
        buf
    }

    fn attribution(req: u64, pid: u32, ok: bool, comm: &[u8]) -> Vec<u8> {
        let mut data = header(0, req, EventKind::Attribution as u8);
        data.extend_from_slice(&pid.to_le_bytes());
        data.push(u8::from(ok));
        data.extend_from_slice(&[0u8; 3]);
        let mut name = [0u8; COMM_LEN];
        let len = comm.len().min(COMM_LEN);
        name[..len].copy_from_slice(&comm[..len]);
        data.extend_from_slice(&name);
        data
    }

    fn completion(req: u64, ts: u64, bytes: u32, rw: u8, major: u32, minor: u32) -> Vec<u8> {
        let mut data = header(ts, req, EventKind::Completion as u8);
        data.extend_from_slice(&bytes.to_le_bytes());
        data.push(rw);
        data.extend_from_slice(&[0u8; 3]);
        data.extend_from_slice(&major.to_le_bytes());
        data.extend_from_slice(&minor.to_le_bytes());
        data
    }

    #[test]
    fn test_empty_data() {
        assert_eq!(parse_event(&[]), Err(ParseError::Truncated { size: 0 }));
    }

    #[test]
    fn test_truncated_header() {
        let data = header(1, 2, EventKind::Start as u8);
        assert_eq!(
            parse_event(&data[..HEADER_SIZE - 1]),
            Err(ParseError::Truncated {
                size: HEADER_SIZE - 1
            })
        );
    }

    #[test]
    fn test_unknown_event_kind() {
        let data = header(1, 2, 42);
        assert_eq!(
            parse_event(&data),
            Err(ParseError::UnknownEventKind { raw: 42 })
        );
    }

    #[test]
    fn test_start() {
        let data = header(1_000, 0x1, EventKind::Start as u8);
        assert_eq!(
            parse_event(&data),
            Ok(BlockEvent::Start {
                req: RequestId(0x1),
                ts_ns: 1_000
            })
        );
    }

    #[test]
    fn test_attribution() {
        let data = attribution(0x1, 42, true, b"fio");
        assert_eq!(
            parse_event(&data),
            Ok(BlockEvent::Attribution {
                req: RequestId(0x1),
                process: Some(ProcessContext::new(42, "fio")),
            })
        );
    }

    #[test]
    fn test_attribution_comm_lookup_failed() {
        let data = attribution(0x1, 42, false, b"");
        assert_eq!(
            parse_event(&data),
            Ok(BlockEvent::Attribution {
                req: RequestId(0x1),
                process: None,
            })
        );
    }

    #[test]
    fn test_attribution_full_width_comm() {
        let data = attribution(0x7, 1, true, b"0123456789abcdef");
        match parse_event(&data) {
            Ok(BlockEvent::Attribution {
                process: Some(p), ..
            }) => assert_eq!(p.comm.to_string(), "0123456789abcdef"),
            other => panic!("unexpected parse result: {other:?}"),
        }
    }

    #[test]
    fn test_attribution_short_payload() {
        let data = attribution(0x1, 42, true, b"fio");
        assert_eq!(
            parse_event(&data[..data.len() - 1]),
            Err(ParseError::PayloadTruncated {
                event_name: "attribution event"
            })
        );
    }

    #[test]
    fn test_completion_write() {
        let data = completion(0x1, 1_500, 4096, 1, 8, 0);
        assert_eq!(
            parse_event(&data),
            Ok(BlockEvent::Completion(Completion {
                req: RequestId(0x1),
                ts_ns: 1_500,
                bytes: 4096,
                direction: Direction::Write,
                device: Device::new(8, 0),
            }))
        );
    }

    #[test]
    fn test_completion_read_nvme() {
        let data = completion(0x2, 2_100, 512, 0, 259, 1);
        match parse_event(&data) {
            Ok(BlockEvent::Completion(c)) => {
                assert_eq!(c.direction, Direction::Read);
                assert_eq!(c.device, Device::new(259, 1));
                assert_eq!(c.bytes, 512);
            }
            other => panic!("unexpected parse result: {other:?}"),
        }
    }

    #[test]
    fn test_completion_invalid_direction() {
        let data = completion(0x1, 1, 1, 7, 8, 0);
        let err = parse_event(&data).expect_err("rwflag 7 must be rejected");
        assert_eq!(
            err,
            ParseError::InvalidDirection {
                event_name: "completion event",
                raw: 7
            }
        );
        assert_eq!(err.as_str(), "invalid_direction");
    }

    #[test]
    fn test_completion_header_only_truncates_payload() {
        let data = header(1, 1, EventKind::Completion as u8);
        assert_eq!(
            parse_event(&data),
            Err(ParseError::PayloadTruncated {
                event_name: "completion event"
            })
        );
    }

    #[test]
    fn test_trailing_bytes_are_ignored() {
        let mut data = header(5, 0x9, EventKind::Start as u8);
        data.extend_from_slice(&[0xAA; 8]);
        assert!(matches!(
            parse_event(&data),
            Ok(BlockEvent::Start { ts_ns: 5, .. })
        ));
    }
}
