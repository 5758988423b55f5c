//! Port allocation for isolated runs.
//!
//! Each run gets a `(port_a, port_b)` pair derived deterministically from
//! its run ID, so the same ID maps to the same ports across restarts. If
//! that pair is taken (bound by something else or held by another run),
//! the allocator scans forward through the ranges for the next free pair.

use crate::types::RunId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::TcpListener;
use thiserror::Error;
use tracing::{debug, info};

/// Number of hex/base36 characters of the run ID used for the index.
const INDEX_PREFIX_LEN: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("no free port pair in {a_start}..{a_end} / {b_start}..{b_end}")]
    Exhausted {
        a_start: u16,
        a_end: u16,
        b_start: u16,
        b_end: u16,
    },
    #[error("invalid port ranges: {0}")]
    InvalidRange(String),
}

pub type Result<T> = std::result::Result<T, PortError>;

/// Ports allocated to one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortPair {
    pub port_a: u16,
    pub port_b: u16,
}

impl std::fmt::Display for PortPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.port_a, self.port_b)
    }
}

/// Two parallel ranges of `size` ports each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRanges {
    pub a_start: u16,
    pub b_start: u16,
    pub size: u16,
}

impl Default for PortRanges {
    fn default() -> Self {
        Self {
            a_start: 9100,
            b_start: 9200,
            size: 15,
        }
    }
}

impl PortRanges {
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(PortError::InvalidRange("range size is zero".into()));
        }
        let a_end = u32::from(self.a_start) + u32::from(self.size);
        let b_end = u32::from(self.b_start) + u32::from(self.size);
        if a_end > u32::from(u16::MAX) + 1 || b_end > u32::from(u16::MAX) + 1 {
            return Err(PortError::InvalidRange("range exceeds 65535".into()));
        }
        let overlap = u32::from(self.a_start) < b_end && u32::from(self.b_start) < a_end;
        if overlap {
            return Err(PortError::InvalidRange(format!(
                "{}..{} overlaps {}..{}",
                self.a_start, a_end, self.b_start, b_end
            )));
        }
        Ok(())
    }

    /// Pair at `index` (taken modulo the range size).
    pub fn pair_at(&self, index: u16) -> PortPair {
        let index = index % self.size;
        PortPair {
            port_a: self.a_start + index,
            port_b: self.b_start + index,
        }
    }

    pub fn contains(&self, pair: PortPair) -> bool {
        pair.port_a >= self.a_start
            && pair.port_a - self.a_start < self.size
            && pair.port_b >= self.b_start
            && pair.port_b - self.b_start < self.size
    }

    fn exhausted(&self) -> PortError {
        PortError::Exhausted {
            a_start: self.a_start,
            a_end: self.a_start + (self.size - 1),
            b_start: self.b_start,
            b_end: self.b_start + (self.size - 1),
        }
    }
}

/// Liveness probe for a single port.
pub trait PortProbe {
    fn is_available(&self, port: u16) -> bool;
}

/// Probes by binding a TCP listener on localhost.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

impl PortProbe for TcpProbe {
    fn is_available(&self, port: u16) -> bool {
        TcpListener::bind(("127.0.0.1", port)).is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct PortAllocator<P = TcpProbe> {
    ranges: PortRanges,
    probe: P,
}

impl PortAllocator<TcpProbe> {
    pub fn new(ranges: PortRanges) -> Result<Self> {
        Self::with_probe(ranges, TcpProbe)
    }
}

impl<P: PortProbe> PortAllocator<P> {
    pub fn with_probe(ranges: PortRanges, probe: P) -> Result<Self> {
        ranges.validate()?;
        Ok(Self { ranges, probe })
    }

    pub fn ranges(&self) -> PortRanges {
        self.ranges
    }

    /// Deterministic slot index for a run ID.
    ///
    /// The first eight characters are read as base-36; IDs that are not
    /// valid base-36 fall back to a SHA-256 of the whole ID.
    pub fn index_for(&self, run_id: &RunId) -> u16 {
        let id = run_id.as_str();
        let prefix: String = id.chars().take(INDEX_PREFIX_LEN).collect();
        let value = u64::from_str_radix(&prefix, 36).unwrap_or_else(|_| {
            let digest = Sha256::digest(id.as_bytes());
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&digest[..8]);
            u64::from_be_bytes(bytes)
        });
        (value % u64::from(self.ranges.size)) as u16
    }

    /// Deterministic pair for a run ID. Pure: no probing.
    pub fn ports_for(&self, run_id: &RunId) -> PortPair {
        self.ranges.pair_at(self.index_for(run_id))
    }

    pub fn is_available(&self, port: u16) -> bool {
        self.probe.is_available(port)
    }

    fn is_free(&self, pair: PortPair, reserved: &[PortPair]) -> bool {
        let held = reserved
            .iter()
            .any(|r| r.port_a == pair.port_a || r.port_b == pair.port_b);
        !held && self.is_available(pair.port_a) && self.is_available(pair.port_b)
    }

    /// Scan forward from the deterministic slot for the next free pair.
    ///
    /// Slots are visited in ascending order starting after the run's own
    /// slot and wrapping at the end of the range. Pairs in `reserved`
    /// (held by other runs) are skipped even if nothing is bound yet.
    pub fn find_alternative(&self, run_id: &RunId, reserved: &[PortPair]) -> Result<PortPair> {
        let base = self.index_for(run_id);
        for offset in 1..self.ranges.size {
            let candidate = self.ranges.pair_at(base.wrapping_add(offset) % self.ranges.size);
            if self.is_free(candidate, reserved) {
                info!(run_id = %run_id, ports = %candidate, "using alternative port pair");
                return Ok(candidate);
            }
            debug!(run_id = %run_id, ports = %candidate, "port pair occupied");
        }
        Err(self.ranges.exhausted())
    }

    /// Deterministic pair if free, otherwise the next free alternative.
    pub fn allocate(&self, run_id: &RunId, reserved: &[PortPair]) -> Result<PortPair> {
        let preferred = self.ports_for(run_id);
        if self.is_free(preferred, reserved) {
            debug!(run_id = %run_id, ports = %preferred, "deterministic port pair is free");
            return Ok(preferred);
        }
        info!(run_id = %run_id, ports = %preferred, "deterministic port pair occupied");
        self.find_alternative(run_id, reserved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    /// Probe backed by a fixed set of bound ports.
    struct Bound(HashSet<u16>);

    impl PortProbe for Bound {
        fn is_available(&self, port: u16) -> bool {
            !self.0.contains(&port)
        }
    }

    fn allocator(bound: &[u16]) -> PortAllocator<Bound> {
        PortAllocator::with_probe(PortRanges::default(), Bound(bound.iter().copied().collect()))
            .unwrap()
    }

    fn id(s: &str) -> RunId {
        RunId::parse(s).unwrap()
    }

    /// A run ID whose deterministic slot is 0.
    fn slot_zero_id(alloc: &PortAllocator<Bound>) -> RunId {
        (0..10_000)
            .map(|n| id(&format!("r{n:07}")))
            .find(|candidate| alloc.index_for(candidate) == 0)
            .unwrap()
    }

    #[test]
    fn ports_for_is_deterministic_and_in_range() {
        let alloc = allocator(&[]);
        for raw in ["abc12345", "deadbeef", "zzzzzzzz", "a", "with_underscore", "x-y"] {
            let run = id(raw);
            let first = alloc.ports_for(&run);
            assert_eq!(first, alloc.ports_for(&run));
            assert!(PortRanges::default().contains(first), "{raw} -> {first}");
            assert_eq!(first.port_b - first.port_a, 100);
        }
    }

    #[test]
    fn index_uses_base36_prefix() {
        let alloc = allocator(&[]);
        // "10" in base 36 is 36; 36 % 15 == 6.
        assert_eq!(alloc.index_for(&id("10")), 6);
        assert_eq!(alloc.ports_for(&id("10")), PortPair { port_a: 9106, port_b: 9206 });
    }

    #[test]
    fn allocate_prefers_deterministic_pair() {
        let alloc = allocator(&[]);
        let run = id("abc12345");
        assert_eq!(alloc.allocate(&run, &[]).unwrap(), alloc.ports_for(&run));
    }

    #[test]
    fn occupied_pair_falls_back_to_next_ascending() {
        let alloc = allocator(&[9100, 9200]);
        let run = slot_zero_id(&alloc);
        assert_eq!(alloc.ports_for(&run), PortPair { port_a: 9100, port_b: 9200 });
        assert_eq!(
            alloc.allocate(&run, &[]).unwrap(),
            PortPair { port_a: 9101, port_b: 9201 }
        );
    }

    #[test]
    fn fallback_skips_pairs_held_by_other_runs() {
        let alloc = allocator(&[9100, 9200]);
        let run = slot_zero_id(&alloc);
        let held = [PortPair { port_a: 9101, port_b: 9201 }];
        assert_eq!(
            alloc.allocate(&run, &held).unwrap(),
            PortPair { port_a: 9102, port_b: 9202 }
        );
    }

    #[test]
    fn a_pair_is_only_free_when_both_ports_are() {
        // Only port_b of slot 1 is bound.
        let alloc = allocator(&[9100, 9201]);
        let run = slot_zero_id(&alloc);
        let pair = alloc.allocate(&run, &[]).unwrap();
        assert_eq!(pair, PortPair { port_a: 9102, port_b: 9202 });
    }

    #[test]
    fn alternative_avoids_every_bound_port() {
        let bound: Vec<u16> = (9100..9110).chain(9200..9205).collect();
        let alloc = allocator(&bound);
        for raw in ["abc12345", "00000000", "q", "run-7"] {
            let pair = alloc.allocate(&id(raw), &[]).unwrap();
            assert!(PortRanges::default().contains(pair));
            assert!(!bound.contains(&pair.port_a));
            assert!(!bound.contains(&pair.port_b));
        }
    }

    #[test]
    fn alternative_wraps_around_the_range() {
        let alloc = allocator(&[9114, 9214]);
        let run = (0..10_000)
            .map(|n| id(&format!("w{n:07}")))
            .find(|c| alloc.index_for(c) == 14)
            .unwrap();
        assert_eq!(
            alloc.allocate(&run, &[]).unwrap(),
            PortPair { port_a: 9100, port_b: 9200 }
        );
    }

    #[test]
    fn exhausted_range_is_an_error() {
        let bound: Vec<u16> = (9100..9115).collect();
        let alloc = allocator(&bound);
        let err = alloc.allocate(&id("abc12345"), &[]).unwrap_err();
        assert!(matches!(err, PortError::Exhausted { .. }));
    }

    #[test]
    fn overlapping_ranges_are_rejected() {
        let ranges = PortRanges {
            a_start: 9100,
            b_start: 9110,
            size: 15,
        };
        assert!(PortAllocator::new(ranges).is_err());
    }

    #[test]
    fn tcp_probe_sees_bound_listener() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!TcpProbe.is_available(port));
        drop(listener);
    }
}
