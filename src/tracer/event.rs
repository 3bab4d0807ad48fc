use std::fmt;

/// Kernel `TASK_COMM_LEN`.
pub const COMM_LEN: usize = 16;

/// Opaque in-flight block request handle (the kernel `struct request *`).
///
/// The kernel reuses it once a request completes, so it is only ever a
/// lookup key while the request is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Fixed-width, NUL-padded task name.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Comm([u8; COMM_LEN]);

impl Comm {
    /// The empty name used for unattributed I/O.
    pub const EMPTY: Comm = Comm([0; COMM_LEN]);

    /// Build from raw bytes, truncating at `COMM_LEN` or the first NUL.
    pub fn from_bytes(raw: &[u8]) -> Self {
        let mut buf = [0u8; COMM_LEN];
        let len = raw
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(raw.len())
            .min(COMM_LEN);
        buf[..len].copy_from_slice(&raw[..len]);
        Self(buf)
    }

    /// Raw NUL-padded bytes.
    pub fn as_bytes(&self) -> &[u8; COMM_LEN] {
        &self.0
    }

    /// Bytes up to the first NUL.
    pub fn trimmed(&self) -> &[u8] {
        let len = self.0.iter().position(|&b| b == 0).unwrap_or(COMM_LEN);
        &self.0[..len]
    }

    pub fn is_empty(&self) -> bool {
        self.0[0] == 0
    }
}

impl From<&str> for Comm {
    fn from(s: &str) -> Self {
        Self::from_bytes(s.as_bytes())
    }
}

impl fmt::Display for Comm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(self.trimmed()))
    }
}

impl fmt::Debug for Comm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Comm({:?})", String::from_utf8_lossy(self.trimmed()))
    }
}

/// The task context that issued a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessContext {
    /// Kernel task id (the low half of `bpf_get_current_pid_tgid`).
    pub pid: u32,
    pub comm: Comm,
}

impl ProcessContext {
    pub fn new(pid: u32, comm: impl Into<Comm>) -> Self {
        Self {
            pid,
            comm: comm.into(),
        }
    }
}

/// Read or write, resolved by the event source from the request flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Direction {
    Read = 0,
    Write = 1,
}

impl Direction {
    pub fn from_is_write(is_write: bool) -> Self {
        if is_write {
            Self::Write
        } else {
            Self::Read
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Block device number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Device {
    pub major: u32,
    pub minor: u32,
}

impl Device {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// Request completion metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub req: RequestId,
    pub ts_ns: u64,
    pub bytes: u64,
    pub direction: Direction,
    pub device: Device,
}

/// Wire discriminant for raw ring buffer records.
/// Values must match `bpf/iomigrater.bpf.c`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventKind {
    Attribution = 1,
    Start = 2,
    Completion = 3,
}

/// Maximum EventKind value, used for array sizing.
pub const MAX_EVENT_KIND: usize = 3;

impl EventKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Attribution => "attribution",
            Self::Start => "start",
            Self::Completion => "completion",
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Attribution),
            2 => Some(Self::Start),
            3 => Some(Self::Completion),
            _ => None,
        }
    }

    pub fn all() -> &'static [Self] {
        &[Self::Attribution, Self::Start, Self::Completion]
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded block-layer event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockEvent {
    /// The request was recognized as issued. `process` is `None` when the
    /// task name could not be read.
    Attribution {
        req: RequestId,
        process: Option<ProcessContext>,
    },
    /// The request began service.
    Start { req: RequestId, ts_ns: u64 },
    /// The request completed.
    Completion(Completion),
}

impl BlockEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Attribution { .. } => EventKind::Attribution,
            Self::Start { .. } => EventKind::Start,
            Self::Completion(_) => EventKind::Completion,
        }
    }

    pub fn req(&self) -> RequestId {
        match self {
            Self::Attribution { req, .. } | Self::Start { req, .. } => *req,
            Self::Completion(c) => c.req,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comm_truncates_to_task_comm_len() {
        let comm = Comm::from("a-very-long-thread-name");
        assert_eq!(comm.trimmed(), b"a-very-long-thre");
        assert_eq!(comm.to_string(), "a-very-long-thre");
    }

    #[test]
    fn test_comm_stops_at_nul() {
        let comm = Comm::from_bytes(b"fio\0garbage");
        assert_eq!(comm.to_string(), "fio");
        assert_eq!(comm, Comm::from("fio"));
    }

    #[test]
    fn test_comm_empty() {
        assert!(Comm::EMPTY.is_empty());
        assert!(Comm::from("").is_empty());
        assert!(!Comm::from("kworker/0:1").is_empty());
        assert_eq!(Comm::EMPTY.to_string(), "");
    }

    #[test]
    fn test_direction_from_is_write() {
        assert_eq!(Direction::from_is_write(true), Direction::Write);
        assert_eq!(Direction::from_is_write(false), Direction::Read);
        assert_eq!(Direction::Write.to_string(), "write");
    }

    #[test]
    fn test_device_display() {
        assert_eq!(Device::new(8, 0).to_string(), "8:0");
        assert_eq!(Device::new(259, 3).to_string(), "259:3");
    }

    #[test]
    fn test_request_id_display_is_hex() {
        assert_eq!(RequestId(0x1).to_string(), "0x1");
        assert_eq!(RequestId(0xffff8881_0a2b3c00).to_string(), "0xffff88810a2b3c00");
    }

    #[test]
    fn test_event_kind_round_trip_all() {
        for kind in EventKind::all() {
            assert_eq!(EventKind::from_u8(*kind as u8), Some(*kind));
        }
        assert_eq!(EventKind::from_u8(0), None);
        assert_eq!(EventKind::from_u8(4), None);
        assert_eq!(EventKind::all().len(), MAX_EVENT_KIND);
    }

    #[test]
    fn test_block_event_accessors() {
        let ev = BlockEvent::Start {
            req: RequestId(9),
            ts_ns: 1,
        };
        assert_eq!(ev.kind(), EventKind::Start);
        assert_eq!(ev.req(), RequestId(9));
    }
}
