/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Node selection: dispatch plus the shared admission protocol.
//!
//! [`Evaluator::evaluate`] takes a candidate node bitmap and a pending job's
//! resource request, and narrows the bitmap down to a selection that
//! satisfies the request under one of seven placement strategies:
//!
//! | Strategy | Intent |
//! |---|---|
//! | block  | pick a power-of-two number of base-blocks within one block |
//! | topo   | minimize leaf-switch count under a single top switch |
//! | dfly   | one leaf switch if possible, else round-robin across leaves |
//! | consec | prefer consecutive index ranges of equal weight |
//! | lln    | least-loaded node first within each weight tier |
//! | busy   | prefer already-busy nodes |
//! | spread | use as many nodes as possible |
//! | serial | serial jobs from the high end of the index range |
//!
//! All strategies share one bookkeeping protocol: group candidates by
//! scheduling weight, admit required nodes unconditionally, probe each
//! candidate with [`select_cores`] / [`cpus_to_use`], commit job-level GRES,
//! and decrement the [`Remainders`] until
//! `rem_nodes ≤ 0 ∧ rem_cpus ≤ 0 ∧ gres satisfied`.
//!
//! Evaluation is strictly single-threaded and deterministic: candidates are
//! consumed in (weight ascending, strategy tie-break, index ascending) order,
//! and the only time dependence is the `wait4switch` bookkeeping, fed from
//! the injected `time_now`.

pub mod error;

mod block;
mod consec;
mod dfly;
mod simple;
mod topo;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::SelectError;

use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::bitmap::{CoreSet, NodeSet};
use crate::config::{EvalConfig, SelectTypeFlags};
use crate::gres::{self, GresAvail};
use crate::job::{JobDetails, JobRecord, McInfo, WholeNode};
use crate::node::{AvailRes, NodeRecord};
use crate::topology::Topology;

// ── Evaluation context ────────────────────────────────────────────────────────

/// Everything one evaluation works on.
///
/// `node_map` comes in as the candidate set and leaves as the selection (or
/// the documented failure post-state).  `avail_res` and `avail_core` are
/// mutated in place through the admission protocol.  The borrowed pieces are
/// owned by the surrounding scheduler, which holds them exclusively for the
/// duration of the call.
pub struct EvalContext<'a> {
    /// Static node record table.
    pub nodes: &'a [NodeRecord],
    /// Fabric topology.
    pub topology: &'a Topology,
    /// The pending job.  Mutated: `best_switch`, `wait4switch_start`,
    /// normalized `req_switch`, GRES commitments.
    pub job: &'a mut JobRecord,
    /// Candidate map on entry, selection on success.
    pub node_map: &'a mut NodeSet,
    /// Per-node availability records.
    pub avail_res: &'a mut [AvailRes],
    /// Per-node available-core bitmaps.
    pub avail_core: &'a mut [CoreSet],
    /// Nodes currently idle; consulted by the busy strategy.  `None` means
    /// every node counts as idle.
    pub idle_node_map: Option<&'a NodeSet>,

    /// Node count targets.
    pub min_nodes: u32,
    /// Preferred node count (`req_nodes ≥ min_nodes`).
    pub req_nodes: u32,
    /// Running node budget; decremented on every admission.
    pub max_nodes: u32,

    /// Prefer nodes that already run jobs.
    pub prefer_alloc_nodes: bool,
    /// GRES task binding is mandatory.
    pub enforce_binding: bool,
    /// Consumable-resource flags for this evaluation.
    pub cr_type: SelectTypeFlags,
    /// Multi-core task layout directives.
    pub mc: McInfo,

    /// Current wall-clock seconds, used only for `wait4switch` bookkeeping.
    pub time_now: i64,

    /// Scratch: CPUs the most recently probed node can contribute.
    pub avail_cpus: u16,
}

// ── Evaluator ─────────────────────────────────────────────────────────────────

/// The node-selection engine.
///
/// Holds the frozen process-wide toggles; all per-run state lives in the
/// [`EvalContext`] and in strategy-local scratch, so the evaluator itself is
/// `Send + Sync` and re-entrant.
pub struct Evaluator {
    cfg: EvalConfig,
}

impl Evaluator {
    /// Create an evaluator with the given frozen configuration.
    pub fn new(cfg: EvalConfig) -> Self {
        Self { cfg }
    }

    /// Evaluate one job against one candidate pool.
    ///
    /// On success `ctx.node_map` holds the selection.  On failure the map is
    /// either cleared (busy / lln / serial / spread) or reduced to the
    /// admitted required subset (topo / dfly / block / consec).
    ///
    /// # Errors
    /// Returns a [`SelectError`] naming the failure; the caller may retry
    /// with a different node-count envelope or candidate map.
    pub fn evaluate(&self, ctx: &mut EvalContext<'_>) -> Result<(), SelectError> {
        let job_id = ctx.job.job_id;
        let candidates = ctx.node_map.count() as u32;
        if candidates < ctx.min_nodes {
            return Err(SelectError::EmptyCandidates {
                job_id,
                avail: candidates,
                min_nodes: ctx.min_nodes,
            });
        }

        if let Some(req) = &ctx.job.details.req_node_bitmap {
            if !ctx.node_map.is_superset(req) {
                return Err(SelectError::RequiredUnavailable { job_id });
            }
        }

        let topology = ctx.topology;
        if let Some(blocks) = &topology.blocks {
            if blocks.nodes_bitmap.overlaps(ctx.node_map) {
                return block::eval(ctx);
            }
        }

        if ctx.job.spread_job {
            return simple::eval_spread(ctx);
        }

        let contiguous = ctx.job.details.contiguous;
        if ctx.prefer_alloc_nodes && !contiguous {
            return simple::eval_busy(ctx);
        }

        if ctx.cr_type.lln || ctx.job.part_lln {
            return simple::eval_lln(ctx);
        }

        if self.cfg.pack_serial_at_end && ctx.job.details.min_cpus == 1 && ctx.req_nodes == 1 {
            return simple::eval_serial(ctx);
        }

        if topology.has_switches()
            && !contiguous
            && (!self.cfg.topo_optional || ctx.job.req_switch > 0)
        {
            if self.cfg.have_dragonfly {
                return dfly::eval(ctx);
            }
            return topo::eval(ctx);
        }

        consec::eval(ctx)
    }
}

// ── Remainders ────────────────────────────────────────────────────────────────

/// Running demand counters, decremented after every admission.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Remainders {
    pub rem_nodes: i64,
    pub min_rem_nodes: i64,
    pub rem_cpus: i64,
    pub rem_max_cpus: i64,
}

impl Remainders {
    /// Standard initialisation: with job-level GRES the node target is
    /// `min(min_nodes, req_nodes)`, otherwise `max(min_nodes, req_nodes)`.
    pub(crate) fn new(
        details: &JobDetails,
        min_nodes: u32,
        req_nodes: u32,
        gres_per_job: bool,
    ) -> Self {
        let nodes = if gres_per_job {
            min_nodes.min(req_nodes)
        } else {
            min_nodes.max(req_nodes)
        };
        Self::with_nodes(details, min_nodes, nodes as i64)
    }

    /// Block-strategy initialisation: always `min(min_nodes, req_nodes)`.
    pub(crate) fn new_min(details: &JobDetails, min_nodes: u32, req_nodes: u32) -> Self {
        Self::with_nodes(details, min_nodes, min_nodes.min(req_nodes) as i64)
    }

    fn with_nodes(details: &JobDetails, min_nodes: u32, rem_nodes: i64) -> Self {
        Self {
            rem_nodes,
            min_rem_nodes: min_nodes as i64,
            rem_cpus: details.min_cpus as i64,
            rem_max_cpus: initial_rem_max_cpus(details, rem_nodes),
        }
    }

    /// Charge one admitted node contributing `avail_cpus` CPUs.
    pub(crate) fn charge(&mut self, avail_cpus: u16) {
        self.rem_nodes -= 1;
        self.min_rem_nodes -= 1;
        self.rem_cpus -= avail_cpus as i64;
        self.rem_max_cpus -= avail_cpus as i64;
    }

    /// Sufficiency test: request satisfied.
    pub(crate) fn satisfied(&self, job: &JobRecord) -> bool {
        self.rem_nodes <= 0 && self.rem_cpus <= 0 && gres_test(job)
    }

    /// End-of-run acceptance: the minimum node count reached.
    pub(crate) fn min_satisfied(&self, job: &JobRecord) -> bool {
        self.min_rem_nodes <= 0 && self.rem_cpus <= 0 && gres_test(job)
    }
}

/// Upper CPU budget: `max(min_cpus, max_cpus)`, lifted by the per-node and
/// job-level GRES CPU minima.
pub(crate) fn initial_rem_max_cpus(details: &JobDetails, rem_nodes: i64) -> i64 {
    let mut rem_max_cpus = details.min_cpus as i64;
    if let Some(max_cpus) = details.max_cpus {
        rem_max_cpus = max_cpus as i64;
    }
    if details.min_gres_cpu > 0 {
        rem_max_cpus = rem_max_cpus.max(details.min_gres_cpu as i64 * rem_nodes);
    }
    if details.min_job_gres_cpu > 0 {
        rem_max_cpus = rem_max_cpus.max(details.min_job_gres_cpu as i64);
    }
    rem_max_cpus
}

/// `avail` candidate nodes satisfy the remaining node demand, accounting for
/// a preferred count above the minimum.
pub(crate) fn enough_nodes(
    avail_nodes: i64,
    rem_nodes: i64,
    min_nodes: u32,
    req_nodes: u32,
) -> bool {
    let needed_nodes = if req_nodes > min_nodes {
        rem_nodes + min_nodes as i64 - req_nodes as i64
    } else {
        rem_nodes
    };
    avail_nodes >= needed_nodes
}

// ── Weight tiers ──────────────────────────────────────────────────────────────

/// One scheduling-weight tier: the candidates sharing a single weight.
pub(crate) struct WeightTier {
    pub weight: u64,
    pub node_map: NodeSet,
    pub node_cnt: u32,
}

/// Partition `set` into weight tiers, ascending by weight.
///
/// `BTreeMap` keeps the tier order deterministic.
pub(crate) fn build_weight_tiers(nodes: &[NodeRecord], set: &NodeSet) -> Vec<WeightTier> {
    let mut by_weight: BTreeMap<u64, NodeSet> = BTreeMap::new();
    for i in set.ones() {
        by_weight
            .entry(nodes[i].sched_weight)
            .or_insert_with(|| NodeSet::new(nodes.len()))
            .set(i);
    }
    by_weight
        .into_iter()
        .map(|(weight, node_map)| WeightTier {
            weight,
            node_cnt: node_map.count() as u32,
            node_map,
        })
        .collect()
}

pub(crate) fn log_weight_tiers(tiers: &[WeightTier]) {
    for tier in tiers {
        debug!(weight = tier.weight, nodes = ?tier.node_map, "weight tier");
    }
}

// ── GRES plumbing ─────────────────────────────────────────────────────────────

/// Reset the job's GRES commitments; `true` iff the job is GRES-constrained.
pub(crate) fn gres_init(job: &mut JobRecord) -> bool {
    job.gres_req.as_mut().is_some_and(|g| g.sched_init())
}

/// Job-level GRES demand met by the commitments so far.
pub(crate) fn gres_test(job: &JobRecord) -> bool {
    job.gres_req.as_ref().is_none_or(|g| g.sched_test())
}

/// Commit an admitted node's GRES, tightening `ctx.avail_cpus` as needed.
pub(crate) fn gres_add(ctx: &mut EvalContext<'_>, node_inx: usize) {
    let EvalContext {
        job,
        avail_res,
        avail_cpus,
        ..
    } = ctx;
    if let (Some(req), Some(sock)) = (
        job.gres_req.as_mut(),
        avail_res[node_inx].sock_gres.as_ref(),
    ) {
        req.sched_add(sock, avail_cpus);
    }
}

/// Fold one node's GRES availability into a run-local bucket.
pub(crate) fn gres_accumulate(
    ctx: &EvalContext<'_>,
    node_inx: usize,
    bucket: &mut Option<GresAvail>,
) {
    if let (Some(req), Some(sock)) = (
        ctx.job.gres_req.as_ref(),
        ctx.avail_res[node_inx].sock_gres.as_ref(),
    ) {
        req.accumulate(bucket, sock);
    }
}

/// Would committing `bucket` on top of the current commitments cover the
/// demand?
pub(crate) fn gres_sufficient(job: &JobRecord, bucket: Option<&GresAvail>) -> bool {
    job.gres_req.as_ref().is_none_or(|g| g.sufficient(bucket))
}

/// Single-node variant: would this node's own GRES cover what is left?
pub(crate) fn gres_sufficient_node(job: &JobRecord, ares: &AvailRes) -> bool {
    match job.gres_req.as_ref() {
        Some(req) => req.sufficient(ares.sock_gres.as_ref().map(|s| &s.avail)),
        None => true,
    }
}

// ── Per-node probe ────────────────────────────────────────────────────────────

/// Per-node core selection: populate `ctx.avail_cpus` with what the node can
/// contribute, respecting the task layout directives, overcommit and the GRES
/// socket/core filter.  Zero means the node cannot host a task.
///
/// Side effects: writes `gres_min_cpus` / `gres_max_tasks` on the node's
/// availability record.
pub(crate) fn select_cores(ctx: &mut EvalContext<'_>, node_inx: usize, _rem_nodes: i64) {
    const UNLIMITED: u32 = u32::MAX;

    let node = &ctx.nodes[node_inx];
    let details = &ctx.job.details;
    let mc = ctx.mc;
    debug_assert!(mc.cpus_per_task >= 1);

    let min_tasks_this_node: u32;
    let mut max_tasks_this_node: u32;
    if mc.ntasks_per_node > 0 {
        min_tasks_this_node = mc.ntasks_per_node as u32;
        max_tasks_this_node = mc.ntasks_per_node as u32;
    } else if mc.ntasks_per_board > 0 {
        min_tasks_this_node = mc.ntasks_per_board as u32;
        max_tasks_this_node = mc.ntasks_per_board as u32 * node.boards.max(1) as u32;
    } else if mc.ntasks_per_socket > 0 {
        min_tasks_this_node = mc.ntasks_per_socket as u32;
        max_tasks_this_node = mc.ntasks_per_socket as u32 * node.tot_sockets.max(1) as u32;
    } else if let Some(ntasks_per_core) = mc.ntasks_per_core.filter(|&n| n > 0) {
        min_tasks_this_node = ntasks_per_core as u32;
        max_tasks_this_node = ntasks_per_core as u32
            * node.tot_cores.saturating_sub(node.core_spec_cnt) as u32;
    } else if let Some(ntasks_per_tres) = details.ntasks_per_tres {
        // Node ranges are not allowed with tasks-per-gres
        if details.min_nodes != 0 && details.min_nodes == details.max_nodes {
            min_tasks_this_node = details.num_tasks.unwrap_or(0) / details.min_nodes;
            max_tasks_this_node = min_tasks_this_node;
        } else {
            min_tasks_this_node = ntasks_per_tres as u32;
            max_tasks_this_node = details.num_tasks.unwrap_or(0);
        }
    } else if details.max_nodes == 1 {
        match details.num_tasks {
            None | Some(0) => {
                min_tasks_this_node = 1;
                max_tasks_this_node = UNLIMITED;
            }
            Some(num_tasks) => {
                min_tasks_this_node = num_tasks;
                max_tasks_this_node = num_tasks;
            }
        }
    } else if details.num_tasks == Some(1)
        || (details.num_tasks.is_some()
            && details.num_tasks == Some(details.min_nodes)
            && details.num_tasks == Some(details.max_nodes))
    {
        min_tasks_this_node = 1;
        max_tasks_this_node = 1;
    } else {
        min_tasks_this_node = 1;
        max_tasks_this_node = UNLIMITED;
    }

    // Determine how many tasks can actually start on this node
    if !details.overcommit {
        let alloc_tasks = ctx.avail_res[node_inx].avail_cpus as u32 / mc.cpus_per_task.max(1) as u32;
        if alloc_tasks < min_tasks_this_node {
            max_tasks_this_node = 0;
        } else if max_tasks_this_node == UNLIMITED || alloc_tasks < max_tasks_this_node {
            max_tasks_this_node = alloc_tasks;
        }
    }

    let mut avail_cpus = ctx.avail_res[node_inx].avail_cpus;
    let mut min_cores_this_node: u32 = 0;

    // Core/CPU filtering for GRES-less jobs already happened upstream; a job
    // with GRES defers it to the joint socket/core filter.
    if let Some(req) = ctx.job.gres_req.as_ref() {
        gres::filter_sock_core(
            req,
            ctx.avail_res[node_inx].sock_gres.as_ref(),
            ctx.enforce_binding,
            &mut avail_cpus,
            &mut max_tasks_this_node,
            &mut min_cores_this_node,
        );
    }

    if max_tasks_this_node == 0 {
        avail_cpus = 0;
    } else if ctx.cr_type.one_task_per_core
        && mc.ntasks_per_core.unwrap_or(0) == 0
        && details.min_gres_cpu == 0
    {
        avail_cpus = ctx.avail_core[node_inx].count().min(u16::MAX as usize) as u16;
    }

    let gres_min_cpus = (node.cpus_per_core() as u32 * min_cores_this_node)
        .min(u16::MAX as u32) as u16;
    let ares = &mut ctx.avail_res[node_inx];
    ares.gres_min_cpus = gres_min_cpus;
    ares.gres_max_tasks = max_tasks_this_node;

    ctx.avail_cpus = avail_cpus;
}

/// Clamp `ctx.avail_cpus` to the per-node policy: reserve CPUs for the nodes
/// still to come, then cap at the remaining CPU budget, floored by
/// `pn_min_cpus` and the GRES CPU minimum.  A whole-node job takes everything
/// the core picker offered.
pub(crate) fn cpus_to_use(
    ctx: &mut EvalContext<'_>,
    node_inx: usize,
    rem_max_cpus: i64,
    rem_nodes: i64,
) {
    if ctx.job.details.whole_node == WholeNode::Required {
        return;
    }

    let node = &ctx.nodes[node_inx];
    // CPUs to be allocated on other nodes
    let mut resv_cpus = rem_nodes.saturating_sub(1).max(0);
    resv_cpus *= node.cpus_per_core() as i64;
    if ctx.cr_type.socket_alloc {
        resv_cpus *= node.cores as i64;
    }
    let rem_max_cpus = rem_max_cpus - resv_cpus;

    if ctx.avail_cpus as i64 > rem_max_cpus {
        let details = &ctx.job.details;
        let mut cpus = rem_max_cpus.max(details.pn_min_cpus as i64);
        let gres_min_cpus = ctx.avail_res[node_inx].gres_min_cpus;
        if gres_min_cpus > 0 {
            cpus = cpus.max(gres_min_cpus as i64);
        } else {
            cpus = cpus.max(details.min_gres_cpu as i64);
        }
        ctx.avail_cpus = cpus.clamp(0, u16::MAX as i64) as u16;
        ctx.avail_res[node_inx].avail_cpus = ctx.avail_cpus;
    }

    let ares = &mut ctx.avail_res[node_inx];
    ares.avail_res_cnt = ares.avail_cpus.saturating_add(ares.avail_gpus);
}

/// Failure post-state for the topology-driven strategies: keep only the
/// admitted required subset (or nothing when the job required none).
pub(crate) fn reduce_to_required(node_map: &mut NodeSet, req: Option<&NodeSet>) {
    match req {
        Some(req) => node_map.and_assign(req),
        None => node_map.clear_all(),
    }
}

/// Count the leaf switches the selection touches and resolve the job's
/// switch preference into `best_switch`: accept the plan when the wait has
/// elapsed or the leaf count honours the preference, otherwise signal the
/// scheduler to defer.
pub(crate) fn note_leaf_usage(
    ctx: &mut EvalContext<'_>,
    switch_node_bitmap: &[NodeSet],
    time_waiting: i64,
) {
    if ctx.job.req_switch == 0 {
        return;
    }
    let topo = ctx.topology;
    let mut leaf_switch_count: i64 = 0;
    for (i, sw) in topo.switches.iter().enumerate() {
        if !sw.is_leaf() {
            continue;
        }
        if switch_node_bitmap[i].overlaps(ctx.node_map) {
            leaf_switch_count += 1;
        }
    }
    if time_waiting >= ctx.job.wait4switch as i64 {
        ctx.job.best_switch = true;
        trace!(
            job = ctx.job.job_id,
            waited = time_waiting,
            leaves = leaf_switch_count,
            "switch wait elapsed, accepting the plan"
        );
    } else if leaf_switch_count > ctx.job.req_switch as i64 {
        // More leaves than the job asked for; let the scheduler defer
        ctx.job.best_switch = false;
        trace!(
            job = ctx.job.job_id,
            waited = time_waiting,
            requested = ctx.job.req_switch,
            found = leaf_switch_count,
            wait = ctx.job.wait4switch,
            "selection spans more leaf switches than requested"
        );
    } else {
        ctx.job.best_switch = true;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
