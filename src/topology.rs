/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Fabric topology models consumed by the selection strategies.
//!
//! Two mutually exclusive shapes are supported:
//!
//! * a **switch tree** — switches with levels (`0` = leaf), parent links
//!   (self-referential at the root) and pairwise hop distances; and
//! * a **hierarchical block layout** — the node table partitioned into
//!   base-blocks that are grouped into power-of-two blocks.
//!
//! The records are built by the surrounding scheduler; this module only
//! defines their shape and the small read helpers the strategies need.

use crate::bitmap::NodeSet;

/// Hop distance marking an unreachable switch pair.
pub const INFINITE_DIST: u32 = u32::MAX;

// ── Switch tree ───────────────────────────────────────────────────────────────

/// One switch in the tree.
#[derive(Debug, Clone)]
pub struct SwitchRecord {
    /// Switch name, for diagnostics.
    pub name: String,

    /// Tree level; `0` is a leaf switch.
    pub level: u16,

    /// Index of the parent switch; equal to the own index at the root.
    pub parent: usize,

    /// Nodes reachable under this switch.
    pub node_bitmap: NodeSet,

    /// Hop distance to every other switch; [`INFINITE_DIST`] when
    /// unreachable.
    pub switches_dist: Vec<u32>,

    /// Uplink speed, for diagnostics.
    pub link_speed: u32,
}

impl SwitchRecord {
    /// `true` for leaf switches.
    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }
}

// ── Hierarchical blocks ───────────────────────────────────────────────────────

/// One base-block: the finest grouping of the block topology.
#[derive(Debug, Clone)]
pub struct BlockRecord {
    /// Base-block name, for diagnostics.
    pub name: String,

    /// Nodes in this base-block.
    pub node_bitmap: NodeSet,
}

/// The hierarchical block layout.
#[derive(Debug, Clone)]
pub struct BlockLayout {
    /// Base-block records; together they partition `nodes_bitmap`.
    pub records: Vec<BlockRecord>,

    /// Bitmask of legal grouping exponents: bit `k` set means a block may
    /// span `2^k` base-blocks.
    pub block_levels: u16,

    /// Nodes per base-block.
    pub bblock_node_cnt: u32,

    /// Union of all base-block node bitmaps.
    pub nodes_bitmap: NodeSet,
}

impl BlockLayout {
    /// First legal grouping exponent at or above `exp`, if any.
    pub fn next_level_from(&self, exp: u32) -> Option<u32> {
        (exp..16).find(|&k| self.block_levels & (1 << k) != 0)
    }
}

// ── Topology ──────────────────────────────────────────────────────────────────

/// The fabric topology handed to an evaluation.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    /// Switch tree; empty when the cluster has no switch fabric.
    pub switches: Vec<SwitchRecord>,

    /// Hierarchical block layout, when the cluster uses one.
    pub blocks: Option<BlockLayout>,
}

impl Topology {
    /// A flat cluster: no switches, no blocks.
    pub fn flat() -> Self {
        Self::default()
    }

    /// `true` when a switch tree is present.
    pub fn has_switches(&self) -> bool {
        !self.switches.is_empty()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(block_levels: u16) -> BlockLayout {
        BlockLayout {
            records: vec![],
            block_levels,
            bblock_node_cnt: 4,
            nodes_bitmap: NodeSet::new(8),
        }
    }

    #[test]
    fn next_level_snaps_up_to_allowed_exponent() {
        // Exponents 1 and 3 allowed.
        let l = layout(0b1010);
        assert_eq!(l.next_level_from(0), Some(1));
        assert_eq!(l.next_level_from(1), Some(1));
        assert_eq!(l.next_level_from(2), Some(3));
        assert_eq!(l.next_level_from(3), Some(3));
        assert_eq!(l.next_level_from(4), None);
    }

    #[test]
    fn no_levels_means_no_exponent() {
        let l = layout(0);
        assert_eq!(l.next_level_from(0), None);
    }

    #[test]
    fn leaf_check_follows_level() {
        let sw = SwitchRecord {
            name: "s0".into(),
            level: 0,
            parent: 0,
            node_bitmap: NodeSet::new(4),
            switches_dist: vec![0],
            link_speed: 100,
        };
        assert!(sw.is_leaf());
    }

    #[test]
    fn flat_topology_has_no_switches() {
        let t = Topology::flat();
        assert!(!t.has_switches());
        assert!(t.blocks.is_none());
    }
}
