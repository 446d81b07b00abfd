//! Version vectors: per-file causal history.
//!
//! A version vector maps each peer to the number of changes that peer has
//! made to a file. Two replicas of a file can be compared causally: one
//! replica may have seen everything the other has (`Less`/`Greater`), both
//! may be identical (`Equal`), or each may have changes the other has not
//! seen (`Concurrent`), which is a conflict.
//!
//! An absent entry reads as zero. Zero entries are never stored, so the
//! derived equality agrees with [`VersionVector::compare`].

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{CoreError, Result};
use crate::types::PeerId;

/// Causal relation between two version vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Causality {
    /// Every entry is `<=` and at least one is strictly smaller.
    Less,
    /// Every entry is `>=` and at least one is strictly larger.
    Greater,
    /// All entries match.
    Equal,
    /// Neither side dominates: conflicting edits.
    Concurrent,
}

impl Causality {
    /// The relation seen from the other side.
    pub const fn reverse(self) -> Self {
        match self {
            Causality::Less => Causality::Greater,
            Causality::Greater => Causality::Less,
            other => other,
        }
    }
}

/// Map from peer to monotonically increasing change counter.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "BTreeMap<PeerId, u64>", into = "BTreeMap<PeerId, u64>")]
pub struct VersionVector(BTreeMap<PeerId, u64>);

impl VersionVector {
    /// The empty vector (every counter zero).
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Build from `(peer, counter)` pairs. Zero counters are dropped.
    pub fn from_entries(entries: impl IntoIterator<Item = (PeerId, u64)>) -> Self {
        entries.into_iter().collect::<BTreeMap<_, _>>().into()
    }

    /// Counter for a peer; absent peers read as zero.
    pub fn get(&self, peer: PeerId) -> u64 {
        self.0.get(&peer).copied().unwrap_or(0)
    }

    /// Increment the local peer's counter and return its new value.
    ///
    /// Only ever called with the caller's own id: a peer never advances
    /// another peer's entry.
    pub fn increment(&mut self, local: PeerId) -> u64 {
        let counter = self.0.entry(local).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Componentwise maximum of two vectors.
    pub fn merge(&self, other: &VersionVector) -> VersionVector {
        let mut merged = self.clone();
        merged.merge_from(other);
        merged
    }

    /// In-place componentwise maximum.
    pub fn merge_from(&mut self, other: &VersionVector) {
        for (&peer, &counter) in &other.0 {
            let entry = self.0.entry(peer).or_insert(0);
            if counter > *entry {
                *entry = counter;
            }
        }
    }

    /// Compare causal histories.
    pub fn compare(&self, other: &VersionVector) -> Causality {
        let mut some_less = false;
        let mut some_greater = false;

        let peers = self.0.keys().chain(other.0.keys());
        for &peer in peers {
            match self.get(peer).cmp(&other.get(peer)) {
                Ordering::Less => some_less = true,
                Ordering::Greater => some_greater = true,
                Ordering::Equal => {}
            }
            if some_less && some_greater {
                return Causality::Concurrent;
            }
        }

        match (some_less, some_greater) {
            (false, false) => Causality::Equal,
            (true, false) => Causality::Less,
            (false, true) => Causality::Greater,
            (true, true) => Causality::Concurrent,
        }
    }

    /// True when `self` has seen everything `other` has.
    pub fn dominates(&self, other: &VersionVector) -> bool {
        matches!(self.compare(other), Causality::Greater | Causality::Equal)
    }

    /// Rewrite peer ids through a translation function.
    ///
    /// Used to interpret a vector expressed in a remote peer's numbering.
    /// Fails if any non-zero entry has no translation.
    pub fn translate<F>(&self, mut map: F) -> Result<VersionVector>
    where
        F: FnMut(PeerId) -> Option<PeerId>,
    {
        let mut out = VersionVector::new();
        for (&peer, &counter) in &self.0 {
            let local = map(peer).ok_or(CoreError::UntranslatedPeer(peer))?;
            let entry = out.0.entry(local).or_insert(0);
            *entry = (*entry).max(counter);
        }
        Ok(out)
    }

    /// Iterate over non-zero entries in peer order.
    pub fn iter(&self) -> impl Iterator<Item = (PeerId, u64)> + '_ {
        self.0.iter().map(|(&peer, &counter)| (peer, counter))
    }

    /// Number of non-zero entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when every counter is zero.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Encode to CBOR for storage.
    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| CoreError::EncodingError(e.to_string()))?;
        Ok(buf)
    }

    /// Decode from CBOR.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::new());
        }
        ciborium::from_reader(bytes).map_err(|e| CoreError::DecodingError(e.to_string()))
    }
}

impl From<BTreeMap<PeerId, u64>> for VersionVector {
    fn from(mut map: BTreeMap<PeerId, u64>) -> Self {
        map.retain(|_, counter| *counter > 0);
        Self(map)
    }
}

impl From<VersionVector> for BTreeMap<PeerId, u64> {
    fn from(vv: VersionVector) -> Self {
        vv.0
    }
}

impl PartialOrd for VersionVector {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match self.compare(other) {
            Causality::Less => Some(Ordering::Less),
            Causality::Greater => Some(Ordering::Greater),
            Causality::Equal => Some(Ordering::Equal),
            Causality::Concurrent => None,
        }
    }
}

impl fmt::Debug for VersionVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.0.iter()).finish()
    }
}

impl fmt::Display for VersionVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (peer, counter)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}:{}", peer, counter)?;
        }
        write!(f, "}}")
    }
}
