/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! The job request snapshot consumed by one evaluation.
//!
//! [`JobRecord`] carries the per-job state (identity, GRES demand, switch
//! preferences and the `best_switch` output); [`JobDetails`] carries the
//! resource request proper; [`McInfo`] carries the multi-core task layout
//! directives.  The evaluation mutates only the documented output fields
//! (`best_switch`, `wait4switch_start`, the normalized `req_switch`, and the
//! GRES commitment state).

use crate::bitmap::NodeSet;
use crate::gres::GresJobReq;

// ── Whole-node placement directive ────────────────────────────────────────────

/// Whole-node allocation directive.
///
/// Only [`WholeNode::Required`] short-circuits the per-node CPU clamping —
/// the job then takes every CPU the core picker offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WholeNode {
    /// No whole-node request.
    #[default]
    NotRequested,
    /// The job requires entire nodes (`--exclusive`).
    Required,
    /// Exclusive per user.
    User,
    /// Exclusive per MCS label.
    Mcs,
}

// ── Multi-core directives ─────────────────────────────────────────────────────

/// Multi-core task layout directives.
///
/// A zero in the `ntasks_per_*` ladder means "not constrained at this level";
/// the first non-zero level wins when deriving the per-node task range.
#[derive(Debug, Clone, Copy)]
pub struct McInfo {
    /// CPUs allocated per task.  Always at least 1.
    pub cpus_per_task: u16,
    /// Tasks per node (0 = unconstrained).
    pub ntasks_per_node: u16,
    /// Tasks per board (0 = unconstrained).
    pub ntasks_per_board: u16,
    /// Tasks per socket (0 = unconstrained).
    pub ntasks_per_socket: u16,
    /// Tasks per core (`None` = unconstrained).
    pub ntasks_per_core: Option<u16>,
}

impl Default for McInfo {
    fn default() -> Self {
        Self {
            cpus_per_task: 1,
            ntasks_per_node: 0,
            ntasks_per_board: 0,
            ntasks_per_socket: 0,
            ntasks_per_core: None,
        }
    }
}

// ── Job details (resource request) ────────────────────────────────────────────

/// The resource request of a pending job.
#[derive(Debug, Clone, Default)]
pub struct JobDetails {
    /// Minimum CPUs across the whole allocation.
    pub min_cpus: u32,

    /// Maximum CPUs across the whole allocation (`None` = unlimited).
    pub max_cpus: Option<u32>,

    /// Total task count (`None` = not specified).
    pub num_tasks: Option<u32>,

    /// Minimum CPUs per node.
    pub pn_min_cpus: u16,

    /// Minimum CPUs per node implied by per-node GRES demand.
    pub min_gres_cpu: u32,

    /// Minimum CPUs implied by job-level GRES demand.
    pub min_job_gres_cpu: u32,

    /// Node count range.  `min_nodes ≤ |selection| ≤ max_nodes` on success.
    pub min_nodes: u32,
    /// Upper bound on the node count carried by the job itself.
    pub max_nodes: u32,

    /// Nodes that MUST appear in the final selection.
    pub req_node_bitmap: Option<NodeSet>,

    /// Allocate consecutive node indexes only.
    pub contiguous: bool,

    /// Whole-node allocation directive.
    pub whole_node: WholeNode,

    /// More tasks than CPUs may be placed per node.
    pub overcommit: bool,

    /// Per-required-node task count overrides, in required-bitmap order.
    /// Consumed by the consecutive strategy only.
    pub arbitrary_tpn: Option<Vec<u16>>,

    /// Tasks per trackable resource (`None` = not requested).
    pub ntasks_per_tres: Option<u16>,
}

// ── Job record ────────────────────────────────────────────────────────────────

/// Per-job state for one evaluation.
#[derive(Debug, Clone, Default)]
pub struct JobRecord {
    /// Job id, used in diagnostics.
    pub job_id: u32,

    /// The resource request.
    pub details: JobDetails,

    /// Job-level GRES demand and commitment state.  `None` when the job
    /// requests no generic resources.
    pub gres_req: Option<GresJobReq>,

    /// Requested maximum leaf-switch count (0 = no preference).
    pub req_switch: u32,

    /// Seconds the job is willing to wait for its switch preference.
    pub wait4switch: u32,

    /// Epoch second the switch wait began; 0 until first evaluated.
    pub wait4switch_start: i64,

    /// Output: `true` when the final plan honours the switch preference (or
    /// the wait has elapsed and the plan is accepted as-is).
    pub best_switch: bool,

    /// Spread the job over as many nodes as possible.
    pub spread_job: bool,

    /// The job's partition carries the least-loaded-node flag.
    pub part_lln: bool,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mc_info_default_has_one_cpu_per_task() {
        let mc = McInfo::default();
        assert_eq!(mc.cpus_per_task, 1);
        assert_eq!(mc.ntasks_per_node, 0);
        assert_eq!(mc.ntasks_per_core, None);
    }

    #[test]
    fn whole_node_default_is_not_requested() {
        assert_eq!(WholeNode::default(), WholeNode::NotRequested);
    }

    #[test]
    fn job_record_default_has_no_switch_preference() {
        let job = JobRecord::default();
        assert_eq!(job.req_switch, 0);
        assert!(!job.best_switch);
        assert!(job.gres_req.is_none());
    }
}
