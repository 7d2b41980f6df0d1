// Snowflake-style ID generator
//
// Layout: 40 bits of milliseconds since ID_EPOCH_MILLIS | 8 bits node | 16 bits sequence.

use crate::domain::error::DomainError;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::warn;

/// Fixed ID epoch: 2023-01-01T00:00:00Z. Must never change after first deployment.
pub const ID_EPOCH_MILLIS: i64 = 1_672_531_200_000;

const NODE_SHIFT: u32 = 16;
const TIME_SHIFT: u32 = 24;
const MAX_MS: u64 = (1 << 40) - 1;
const MAX_SEQ: u64 = (1 << 16) - 1;

/// Largest allowed node ID
pub const MAX_NODE_ID: u16 = 255;

/// How far the generator may run ahead of the wall clock before it complains
const DRIFT_WARN_MS: u64 = 1000;

/// 64-bit time-ordered identifier. Zero means "none".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(u64);

impl Id {
    pub const ZERO: Id = Id(0);

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Milliseconds since the ID epoch
    pub const fn epoch_millis(self) -> u64 {
        self.0 >> TIME_SHIFT
    }

    pub const fn node(self) -> u8 {
        ((self.0 >> NODE_SHIFT) & 0xff) as u8
    }

    pub const fn seq(self) -> u16 {
        (self.0 & MAX_SEQ) as u16
    }

    /// Unix time in milliseconds encoded in this ID
    pub fn time_millis(self) -> i64 {
        ID_EPOCH_MILLIS + self.epoch_millis() as i64
    }

    pub fn time(self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.time_millis())
            .single()
            .unwrap_or_default()
    }

    /// Smallest possible ID allocated at `unix_ms`. Times before the epoch
    /// clamp to zero. Used as a pruning cutoff.
    pub fn min_at(unix_ms: i64) -> Id {
        if unix_ms <= ID_EPOCH_MILLIS {
            return Id::ZERO;
        }
        let ms = ((unix_ms - ID_EPOCH_MILLIS) as u64).min(MAX_MS);
        Id(ms << TIME_SHIFT)
    }

    fn compose(ms: u64, node: u8, seq: u64) -> Id {
        Id((ms << TIME_SHIFT) | ((node as u64) << NODE_SHIFT) | seq)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            write!(f, "0")
        } else {
            write!(f, "{:016x}", self.0)
        }
    }
}

impl FromStr for Id {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > 16 {
            return Err(DomainError::InvalidId(s.to_string()));
        }
        u64::from_str_radix(s, 16)
            .map(Id)
            .map_err(|_| DomainError::InvalidId(s.to_string()))
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

struct GenState {
    last_ms: u64,
    last_seq: u64,
}

/// Monotonic ID generator for one node
pub struct IdGenerator {
    node: u8,
    state: Mutex<GenState>,
}

impl IdGenerator {
    /// Create a generator
    ///
    /// # Arguments
    /// * `node` - Node ID, 0..=255
    /// * `memento` - Last millisecond (since the ID epoch) observed by a previous run.
    ///   That millisecond counts as used up, so the first ID lands after it.
    ///
    /// # Panics
    /// If `node` does not fit in 8 bits.
    pub fn new(node: u16, memento: u64) -> Self {
        assert!(
            node <= MAX_NODE_ID,
            "ID generator node {node} does not fit in 8 bits"
        );
        Self {
            node: node as u8,
            state: Mutex::new(GenState {
                last_ms: memento.min(MAX_MS),
                last_seq: if memento > 0 { MAX_SEQ } else { 0 },
            }),
        }
    }

    pub fn node(&self) -> u8 {
        self.node
    }

    /// Last millisecond handed out, to be persisted across restarts
    pub fn memento(&self) -> u64 {
        self.lock().last_ms
    }

    /// Allocate the next ID for wall time `now_unix_ms`
    ///
    /// # Panics
    /// If `now_unix_ms` is before the ID epoch or past the 40-bit range.
    pub fn next_at(&self, now_unix_ms: i64) -> Id {
        assert!(
            now_unix_ms >= ID_EPOCH_MILLIS,
            "ID requested for time {now_unix_ms} before the ID epoch"
        );
        let ms = (now_unix_ms - ID_EPOCH_MILLIS) as u64;
        assert!(ms <= MAX_MS, "ID requested for time {now_unix_ms} past 40 bits");

        let (id, ahead) = {
            let mut st = self.lock();
            if ms > st.last_ms {
                st.last_ms = ms;
                st.last_seq = 1;
            } else {
                st.last_seq += 1;
                if st.last_seq > MAX_SEQ {
                    st.last_ms += 1;
                    st.last_seq = 1;
                    assert!(st.last_ms <= MAX_MS, "ID generator ran past 40 bits");
                }
            }
            (
                Id::compose(st.last_ms, self.node, st.last_seq),
                st.last_ms.saturating_sub(ms),
            )
        };

        if ahead > DRIFT_WARN_MS {
            warn!(
                ahead_ms = ahead,
                node = self.node,
                "ID generator running ahead of wall clock"
            );
        }
        id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GenState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdGenerator")
            .field("node", &self.node)
            .field("memento", &self.memento())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generator_sequence_for_node_0x42() {
        let gen = IdGenerator::new(0x42, 0);
        let t0 = ID_EPOCH_MILLIS + 1;

        let ids: Vec<u64> = [t0, t0, t0, t0, t0 + 1, ID_EPOCH_MILLIS + 0x13_97f2_0801]
            .iter()
            .map(|&t| gen.next_at(t).raw())
            .collect();

        assert_eq!(
            ids,
            vec![
                0x0000_0000_0142_0001,
                0x0000_0000_0142_0002,
                0x0000_0000_0142_0003,
                0x0000_0000_0142_0004,
                0x0000_0000_0242_0001,
                0x1397_f208_0142_0001,
            ]
        );
    }

    #[test]
    fn test_ids_strictly_increase_and_time_never_regresses() {
        let gen = IdGenerator::new(7, 0);
        let base = ID_EPOCH_MILLIS + 10_000;
        let mut prev = Id::ZERO;
        // Clock jumps backwards halfway through
        for t in [base, base, base + 5, base + 2, base + 2, base + 6] {
            let id = gen.next_at(t);
            assert!(id > prev);
            assert!(id.time_millis() >= prev.time_millis());
            prev = id;
        }
    }

    #[test]
    fn test_sequence_overflow_bumps_millisecond() {
        let gen = IdGenerator::new(1, 0);
        let t = ID_EPOCH_MILLIS + 50;
        let mut last = Id::ZERO;
        for _ in 0..=MAX_SEQ {
            last = gen.next_at(t);
        }
        assert_eq!(last.epoch_millis(), 51);
        assert_eq!(last.seq(), 1);
        assert_eq!(gen.memento(), 51);
    }

    #[test]
    fn test_memento_prevents_regression() {
        let gen = IdGenerator::new(0, 500);
        let id = gen.next_at(ID_EPOCH_MILLIS + 100);
        assert_eq!(id.epoch_millis(), 501);
        assert_eq!(id.seq(), 1);
        assert_eq!(gen.memento(), 501);
    }

    #[test]
    fn test_restart_never_reissues_last_id() {
        let before = IdGenerator::new(0x42, 0);
        let t = ID_EPOCH_MILLIS + 700;
        let last = before.next_at(t);

        // Restart in the same millisecond, and again with the clock behind
        let same_ms = IdGenerator::new(0x42, before.memento());
        assert!(same_ms.next_at(t) > last);
        let clock_behind = IdGenerator::new(0x42, before.memento());
        assert!(clock_behind.next_at(t - 300) > last);

        // A later clock is used as is
        let later = IdGenerator::new(0x42, before.memento());
        assert_eq!(later.next_at(t + 5).epoch_millis(), 705);
    }

    #[test]
    #[should_panic(expected = "before the ID epoch")]
    fn test_time_before_epoch_panics() {
        IdGenerator::new(0, 0).next_at(ID_EPOCH_MILLIS - 1);
    }

    #[test]
    #[should_panic(expected = "does not fit in 8 bits")]
    fn test_wide_node_panics() {
        IdGenerator::new(256, 0);
    }

    #[test]
    fn test_format_and_parse() {
        assert_eq!(Id::ZERO.to_string(), "0");
        let id = Id::from_raw(0x0000_0000_0142_0001);
        assert_eq!(id.to_string(), "0000000001420001");
        assert_eq!("0000000001420001".parse::<Id>().unwrap(), id);
        assert_eq!("0".parse::<Id>().unwrap(), Id::ZERO);
        assert_eq!(Id::from_raw(u64::MAX).to_string(), "ffffffffffffffff");
        assert!("".parse::<Id>().is_err());
        assert!("xyz".parse::<Id>().is_err());
        assert!("00000000014200011".parse::<Id>().is_err());
    }

    #[test]
    fn test_lexical_order_matches_numeric_order() {
        let a = Id::from_raw(0x0000_0000_0242_0001);
        let b = Id::from_raw(0x0000_0001_0000_0000);
        assert!(a < b);
        assert!(a.to_string() < b.to_string());
    }

    #[test]
    fn test_min_at_cutoffs() {
        assert_eq!(Id::min_at(ID_EPOCH_MILLIS - 10), Id::ZERO);
        let cutoff = Id::min_at(ID_EPOCH_MILLIS + 2);
        let gen = IdGenerator::new(9, 0);
        assert!(gen.next_at(ID_EPOCH_MILLIS + 1) < cutoff);
        assert!(gen.next_at(ID_EPOCH_MILLIS + 2) >= cutoff);
    }

    #[test]
    fn test_serde_as_hex_string() {
        let id = Id::from_raw(0xabc);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"0000000000000abc\"");
        let back: Id = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
