use std::fmt;

use crate::tracer::event::{Comm, Device, Direction};

/// One reporting bucket: (task, direction, device, task name).
///
/// Equality is structural, so two tasks reusing a pid with different names
/// land in different buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AggregateKey {
    pub pid: u32,
    pub direction: Direction,
    pub major: u32,
    pub minor: u32,
    pub comm: Comm,
}

impl AggregateKey {
    /// Key for I/O whose issuing task was never seen.
    pub fn unattributed(direction: Direction, device: Device) -> Self {
        Self {
            pid: 0,
            direction,
            major: device.major,
            minor: device.minor,
            comm: Comm::EMPTY,
        }
    }

    pub fn device(&self) -> Device {
        Device::new(self.major, self.minor)
    }

    pub fn is_unattributed(&self) -> bool {
        self.pid == 0 && self.comm.is_empty()
    }
}

impl fmt::Display for AggregateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pid={} comm={:?} {} dev={}:{}",
            self.pid,
            self.comm.to_string(),
            self.direction,
            self.major,
            self.minor
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn key(pid: u32, comm: &str, direction: Direction) -> AggregateKey {
        AggregateKey {
            pid,
            direction,
            major: 8,
            minor: 0,
            comm: Comm::from(comm),
        }
    }

    #[test]
    fn test_key_as_map_key() {
        let mut map: HashMap<AggregateKey, u32> = HashMap::new();
        let k = key(42, "fio", Direction::Write);
        map.insert(k, 1);
        assert_eq!(map.get(&k), Some(&1));
    }

    #[test]
    fn test_key_equality_is_structural() {
        assert_eq!(key(42, "fio", Direction::Write), key(42, "fio", Direction::Write));
        assert_ne!(key(42, "fio", Direction::Write), key(42, "fio", Direction::Read));
        assert_ne!(key(42, "fio", Direction::Write), key(42, "dd", Direction::Write));
        assert_ne!(key(42, "fio", Direction::Write), key(43, "fio", Direction::Write));

        let mut other_dev = key(42, "fio", Direction::Write);
        other_dev.minor = 1;
        assert_ne!(other_dev, key(42, "fio", Direction::Write));
    }

    #[test]
    fn test_unattributed_key() {
        let k = AggregateKey::unattributed(Direction::Read, Device::new(8, 16));
        assert!(k.is_unattributed());
        assert_eq!(k.pid, 0);
        assert_eq!(k.device(), Device::new(8, 16));
        assert!(!key(42, "fio", Direction::Read).is_unattributed());
    }

    #[test]
    fn test_key_display() {
        assert_eq!(
            key(42, "fio", Direction::Write).to_string(),
            "pid=42 comm=\"fio\" write dev=8:0"
        );
    }
}
