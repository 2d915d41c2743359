/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Compact bit sets over the static node (and per-node core) tables.
//!
//! [`NodeSet`] is a fixed-width bitmap indexed `0..N-1` over the node record
//! table.  Every selection strategy communicates through these: the candidate
//! map comes in as a `NodeSet`, the chosen nodes go out as a `NodeSet`, and
//! all transient working sets (weight tiers, per-switch memberships, best-set
//! accumulators) are `NodeSet`s as well.
//!
//! All sets taking part in one evaluation share the same width; the bulk
//! operations (`and_assign`, `or_assign`, …) debug-assert that.  Word-level
//! operations keep the unused tail bits of the last storage word zero, so
//! `count()` and the word-wise subset/overlap tests stay exact.

use bitvec::prelude::*;

/// Per-node core bitmap.  Same representation as [`NodeSet`], indexed over a
/// node's core table instead of the node table.
pub type CoreSet = NodeSet;

/// A fixed-width set of node indexes backed by a `u64` bit vector.
#[derive(Clone, PartialEq, Eq)]
pub struct NodeSet {
    bits: BitVec<u64, Lsb0>,
}

impl NodeSet {
    /// Create an empty set able to hold indexes `0..len`.
    pub fn new(len: usize) -> Self {
        Self {
            bits: bitvec![u64, Lsb0; 0; len],
        }
    }

    /// Create a set from explicit member indexes.
    pub fn from_indices(len: usize, indices: &[usize]) -> Self {
        let mut set = Self::new(len);
        for &i in indices {
            set.set(i);
        }
        set
    }

    /// Width of the set (number of addressable indexes, not members).
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// `true` if the set has no addressable indexes at all.
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Membership test for index `i`.
    pub fn test(&self, i: usize) -> bool {
        self.bits[i]
    }

    /// Add index `i` to the set.
    pub fn set(&mut self, i: usize) {
        self.bits.set(i, true);
    }

    /// Remove index `i` from the set.
    pub fn clear(&mut self, i: usize) {
        self.bits.set(i, false);
    }

    /// Remove every member.
    pub fn clear_all(&mut self) {
        self.bits.fill(false);
    }

    /// Number of members.
    pub fn count(&self) -> usize {
        self.bits.count_ones()
    }

    /// Lowest member index, if any.
    pub fn first_set(&self) -> Option<usize> {
        self.bits.first_one()
    }

    /// Highest member index, if any.
    pub fn last_set(&self) -> Option<usize> {
        self.bits.last_one()
    }

    /// Iterate member indexes in ascending order.
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }

    /// `true` iff every member of `other` is also a member of `self`.
    pub fn is_superset(&self, other: &NodeSet) -> bool {
        debug_assert_eq!(self.len(), other.len());
        self.bits
            .as_raw_slice()
            .iter()
            .zip(other.bits.as_raw_slice())
            .all(|(s, o)| o & !s == 0)
    }

    /// `true` iff the two sets share at least one member.
    pub fn overlaps(&self, other: &NodeSet) -> bool {
        debug_assert_eq!(self.len(), other.len());
        self.bits
            .as_raw_slice()
            .iter()
            .zip(other.bits.as_raw_slice())
            .any(|(s, o)| s & o != 0)
    }

    /// `self &= other`
    pub fn and_assign(&mut self, other: &NodeSet) {
        debug_assert_eq!(self.len(), other.len());
        for (s, o) in self
            .bits
            .as_raw_mut_slice()
            .iter_mut()
            .zip(other.bits.as_raw_slice())
        {
            *s &= *o;
        }
    }

    /// `self |= other`
    pub fn or_assign(&mut self, other: &NodeSet) {
        debug_assert_eq!(self.len(), other.len());
        for (s, o) in self
            .bits
            .as_raw_mut_slice()
            .iter_mut()
            .zip(other.bits.as_raw_slice())
        {
            *s |= *o;
        }
    }

    /// `self &= !other`
    pub fn and_not_assign(&mut self, other: &NodeSet) {
        debug_assert_eq!(self.len(), other.len());
        for (s, o) in self
            .bits
            .as_raw_mut_slice()
            .iter_mut()
            .zip(other.bits.as_raw_slice())
        {
            *s &= !*o;
        }
    }

    /// Overwrite `self` with the contents of `other` (same width).
    pub fn copy_from(&mut self, other: &NodeSet) {
        debug_assert_eq!(self.len(), other.len());
        self.bits.copy_from_bitslice(&other.bits);
    }
}

impl std::fmt::Debug for NodeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("NodeSet{")?;
        for (n, i) in self.ones().enumerate() {
            if n > 0 {
                f.write_str(",")?;
            }
            write!(f, "{i}")?;
        }
        f.write_str("}")
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
