/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Per-node records: the static hardware description and the mutable
//! availability bookkeeping.
//!
//! Two distinct types model the two sides of an evaluation:
//!
//! ```text
//! NodeRecord  ── read-only during evaluation (hardware shape, weight)
//! AvailRes    ── mutated through documented side effects (CPUs the job
//!                may take on this node, GRES hints from the core picker)
//! ```
//!
//! # Ownership model
//! The node record table is borrowed immutably for the whole evaluation; the
//! availability array is borrowed mutably.  Neither is allocated here — the
//! surrounding scheduler owns both and passes slices in.

use crate::gres::SockGres;

// ── NodeRecord (read-only) ────────────────────────────────────────────────────

/// Static description of one compute node.
#[derive(Debug, Clone, Default)]
pub struct NodeRecord {
    /// Node name, used in diagnostics only.
    pub name: String,

    /// Scheduling weight.  Lower weight is preferred; candidates are always
    /// consumed in ascending weight tiers.
    pub sched_weight: u64,

    /// Total CPUs (threads) on the node.
    pub cpus: u16,

    /// Baseboards on the node.
    pub boards: u16,

    /// Total sockets across all boards.
    pub tot_sockets: u16,

    /// Cores per socket.
    pub cores: u16,

    /// Total cores on the node.
    pub tot_cores: u16,

    /// Threads per core.
    pub tpc: u16,

    /// Cores reserved for system use, excluded from task placement.
    pub core_spec_cnt: u16,
}

impl NodeRecord {
    /// CPUs per allocation core — the multiple used when reserving CPUs for
    /// future nodes and when converting minimum core counts to CPU counts.
    pub fn cpus_per_core(&self) -> u16 {
        self.tpc.max(1)
    }
}

// ── AvailRes (mutable availability record) ────────────────────────────────────

/// Per-node availability bookkeeping for one evaluation.
///
/// `avail_cpus` starts as the output of the external per-node core picker and
/// is tightened in place by the admission protocol (`cpus_to_use`, GRES
/// commits).  `gres_min_cpus` / `gres_max_tasks` are populated by the core
/// selection step when the job carries GRES.
#[derive(Debug, Clone, Default)]
pub struct AvailRes {
    /// CPUs this node can contribute after per-node filtering.
    pub avail_cpus: u16,

    /// Upper bound on usable CPUs; numerator of the least-loaded ratio.
    pub max_cpus: u16,

    /// GPUs available on this node.
    pub avail_gpus: u16,

    /// Derived: `avail_cpus + avail_gpus`.
    pub avail_res_cnt: u16,

    /// Per-socket GRES availability, consumed by the GRES filter and the
    /// job-level GRES commit.  `None` when the node carries no GRES.
    pub sock_gres: Option<SockGres>,

    /// Minimum CPUs implied by GRES core binding; written by core selection.
    pub gres_min_cpus: u16,

    /// Task ceiling implied by GRES availability; written by core selection.
    pub gres_max_tasks: u32,
}

impl AvailRes {
    /// A node offering `cpus` CPUs with no GRES attached.
    pub fn with_cpus(cpus: u16) -> Self {
        Self {
            avail_cpus: cpus,
            max_cpus: cpus,
            avail_res_cnt: cpus,
            ..Default::default()
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
