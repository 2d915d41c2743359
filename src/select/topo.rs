/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! General switch-tree strategy: allocate under a single top-level switch
//! using as few leaf switches as possible.
//!
//! The top switch is the highest-level switch containing every required node
//! (or, with no required nodes, the highest-level sufficient switch holding
//! the lowest-weight tier).  Candidates outside its subtree are dropped.
//! Leaves are then consumed in order of hop distance from the already
//! required leaf set; among equally distant leaves the tightest sufficient
//! fit wins, climbing to common ancestors to break ties.
//!
//! When the job caps its leaf-switch count (`req_switch`) and the plan
//! exceeds it, the strategy rolls back to a checkpoint taken right after
//! required-node admission and retries with one fewer preferred node, until
//! the preferred count reaches the minimum or the plan fits.  If the job has
//! waited long enough (`wait4switch`) the oversized plan is accepted as-is;
//! otherwise `best_switch` is cleared so the scheduler can defer.

use tracing::{debug, error, info, trace};

use super::{
    build_weight_tiers, cpus_to_use, enough_nodes, gres_accumulate, gres_add, gres_init,
    gres_sufficient, gres_test, log_weight_tiers, note_leaf_usage, reduce_to_required,
    select_cores, EvalContext, Remainders, SelectError, WeightTier,
};
use crate::bitmap::NodeSet;
use crate::gres::GresAvail;
use crate::topology::{Topology, INFINITE_DIST};

pub(crate) fn eval(ctx: &mut EvalContext<'_>) -> Result<(), SelectError> {
    let req_map = ctx.job.details.req_node_bitmap.clone();
    let rc = topo_inner(ctx, req_map.as_ref());
    if rc.is_err() {
        reduce_to_required(ctx.node_map, req_map.as_ref());
    }
    rc
}

// ── Distance helpers ──────────────────────────────────────────────────────────

/// Fold switch `inx`'s hop distances into the running distance sums.
fn add_dist(dist: &mut [u32], topo: &Topology, inx: usize) {
    for i in 0..dist.len() {
        let hop = topo.switches[inx].switches_dist[i];
        if hop == INFINITE_DIST || dist[i] == INFINITE_DIST {
            dist[i] = INFINITE_DIST;
        } else {
            dist[i] = dist[i].saturating_add(hop);
        }
    }
}

/// Rank switch `i` against switch `j`: positive when `i` is the better pick.
///
/// A switch *fits* if it alone covers the remaining node and CPU demand.
/// Between two fitting switches the smaller (tighter) wins; a fitting switch
/// beats a non-fitting one; between two non-fitting switches the comparison
/// climbs to the parents until a common ancestor is reached, then falls back
/// to size and level.
fn compare_switches(
    mut i: usize,
    mut j: usize,
    rem_nodes: i64,
    switch_node_cnt: &[i64],
    rem_cpus: i64,
    switch_cpu_cnt: &[i64],
    topo: &Topology,
) -> i32 {
    loop {
        let i_fit = switch_node_cnt[i] >= rem_nodes && switch_cpu_cnt[i] >= rem_cpus;
        let j_fit = switch_node_cnt[j] >= rem_nodes && switch_cpu_cnt[j] >= rem_cpus;
        if i_fit && j_fit {
            if switch_node_cnt[i] < switch_node_cnt[j] {
                return 1;
            }
            if switch_node_cnt[i] > switch_node_cnt[j] {
                return -1;
            }
            break;
        } else if i_fit {
            return 1;
        } else if j_fit {
            return -1;
        }

        let pi = topo.switches[i].parent;
        let pj = topo.switches[j].parent;
        if (pi != i || pj != j) && pi != pj {
            i = pi;
            j = pj;
            continue;
        }
        break;
    }

    if switch_node_cnt[i] > switch_node_cnt[j] {
        return 1;
    }
    if switch_node_cnt[i] < switch_node_cnt[j] {
        return -1;
    }
    if topo.switches[i].level < topo.switches[j].level {
        return 1;
    }
    if topo.switches[i].level > topo.switches[j].level {
        return -1;
    }
    0
}

/// Consider leaf `i` as the next expansion pick against the current best.
fn choose_best_switch(
    dist: &[u32],
    switch_node_cnt: &[i64],
    rem_nodes: i64,
    switch_cpu_cnt: &[i64],
    rem_cpus: i64,
    topo: &Topology,
    i: usize,
    best_switch: &mut Option<usize>,
) {
    let Some(best) = *best_switch else {
        // First possibility
        if switch_node_cnt[i] != 0 && dist[i] < INFINITE_DIST {
            *best_switch = Some(i);
        }
        return;
    };
    if dist[i] == INFINITE_DIST || switch_node_cnt[i] == 0 {
        return;
    }

    let tcs = compare_switches(
        i,
        best,
        rem_nodes,
        switch_node_cnt,
        rem_cpus,
        switch_cpu_cnt,
        topo,
    );
    if (dist[i] < dist[best] && tcs >= 0) || (dist[i] == dist[best] && tcs > 0) {
        // Closer and fits the request, or same distance and a tighter fit
        *best_switch = Some(i);
    }
}

// ── Attempt state ─────────────────────────────────────────────────────────────

/// Per-attempt working set, restored from the checkpoint on every retry.
struct Attempt<'s> {
    rem: &'s mut Remainders,
    req_nodes_target: u32,
    top_switch_inx: usize,
    gres_per_job: bool,
    req_map: Option<&'s NodeSet>,
    switch_node_bitmap: &'s mut [NodeSet],
    switch_cpu_cnt: &'s [i64],
    switch_required: &'s mut [bool],
    avail_cpu_per_node: &'s mut [u16],
    tiers: &'s mut [WeightTier],
}

fn topo_inner(ctx: &mut EvalContext<'_>, req_map: Option<&NodeSet>) -> Result<(), SelectError> {
    let job_id = ctx.job.job_id;
    let node_cnt = ctx.nodes.len();
    let topo = ctx.topology;
    let switch_cnt = topo.switches.len();
    ctx.avail_cpus = 0;

    let org_max_nodes = ctx.max_nodes;

    let mut time_waiting: i64 = 0;
    if ctx.job.req_switch > 0 {
        if ctx.job.wait4switch_start == 0 {
            ctx.job.wait4switch_start = ctx.time_now;
        }
        time_waiting = ctx.time_now - ctx.job.wait4switch_start;
    }

    let gres_per_job = gres_init(ctx.job);
    let mut rem = Remainders::new(
        &ctx.job.details,
        ctx.min_nodes,
        ctx.req_nodes,
        gres_per_job,
    );

    let mut req_node_cnt: u32 = 0;
    if let Some(req) = req_map {
        req_node_cnt = req.count() as u32;
        if req_node_cnt == 0 {
            info!(job = job_id, "required node list has no nodes");
            return Err(SelectError::RequiredUnavailable { job_id });
        }
        if req_node_cnt > ctx.max_nodes {
            info!(
                job = job_id,
                required = req_node_cnt,
                max_nodes = ctx.max_nodes,
                "requires more nodes than currently available"
            );
            return Err(SelectError::RequiredExcess {
                job_id,
                required: req_node_cnt,
                max_nodes: ctx.max_nodes,
            });
        }
    }

    if ctx.node_map.count() == 0 {
        debug!(job = job_id, "candidate map is empty");
        return Err(SelectError::InsufficientPool { job_id });
    }

    // Admit required nodes and group every candidate by weight
    let mut avail_cpu_per_node = vec![0u16; node_cnt];
    let candidates = ctx.node_map.clone();
    for i in candidates.ones() {
        if req_map.is_some_and(|r| r.test(i)) {
            select_cores(ctx, i, rem.min_rem_nodes);
            cpus_to_use(ctx, i, rem.rem_max_cpus, rem.min_rem_nodes);
            if gres_per_job {
                gres_add(ctx, i);
            }
            if ctx.avail_cpus == 0 {
                trace!(
                    job = job_id,
                    node = %ctx.nodes[i].name,
                    "insufficient resources on required node"
                );
                return Err(SelectError::RequiredNodeNoResources {
                    job_id,
                    node: ctx.nodes[i].name.clone(),
                });
            }
            avail_cpu_per_node[i] = ctx.avail_cpus;
            rem.charge(ctx.avail_cpus);
            ctx.max_nodes = ctx.max_nodes.saturating_sub(1);
        }
    }
    let mut tiers = build_weight_tiers(ctx.nodes, &candidates);
    log_weight_tiers(&tiers);

    // Identify the top switch: highest level containing all required nodes,
    // or the highest sufficient level holding the lowest-weight candidates.
    // Nodes can sit on multiple non-overlapping switches.
    let mut switch_cpu_cnt = vec![0i64; switch_cnt];
    let mut switch_node_bitmap: Vec<NodeSet> = Vec::with_capacity(switch_cnt);
    let mut switch_required = vec![false; switch_cnt];
    let mut top_switch_inx: Option<usize> = None;
    let mut top_switch_lowest_weight = u64::MAX;

    for (i, sw) in topo.switches.iter().enumerate() {
        let mut members = sw.node_bitmap.clone();
        members.and_assign(ctx.node_map);
        let switch_nodes = members.count() as i64;
        switch_cpu_cnt[i] = members
            .ones()
            .map(|j| ctx.avail_res[j].avail_cpus as i64)
            .sum();
        switch_node_bitmap.push(members);

        if let Some(req) = req_map {
            if req.overlaps(&switch_node_bitmap[i]) {
                switch_required[i] = true;
                if top_switch_inx.is_none_or(|t| sw.level > topo.switches[t].level) {
                    top_switch_inx = Some(i);
                }
            }
        }
        if !enough_nodes(switch_nodes, rem.rem_nodes, ctx.min_nodes, ctx.req_nodes)
            || rem.rem_cpus > switch_cpu_cnt[i]
        {
            continue;
        }
        if req_map.is_none() {
            if let Some(tier) = tiers
                .iter()
                .find(|t| t.node_map.overlaps(&switch_node_bitmap[i]))
            {
                if top_switch_inx.is_none()
                    || (sw.level >= topo.switches[top_switch_inx.unwrap()].level
                        && tier.weight <= top_switch_lowest_weight)
                {
                    top_switch_inx = Some(i);
                    top_switch_lowest_weight = tier.weight;
                }
            }
        }
    }

    if req_map.is_none() {
        ctx.node_map.clear_all();
    }

    // May be unresolvable on a disjoint topology, with the available nodes
    // living on different switches
    let Some(top_switch_inx) = top_switch_inx else {
        debug!(job = job_id, "unable to identify top level switch");
        return Err(SelectError::TopSwitchUnknown { job_id });
    };

    // All specifically required nodes must share the network
    if let Some(req) = req_map {
        if !switch_node_bitmap[top_switch_inx].is_superset(req) {
            info!(job = job_id, "requires nodes that do not have shared network");
            return Err(SelectError::TopologySplit {
                job_id,
                region: "switch subtree",
            });
        }
    }

    // Remove nodes unreachable from the top switch
    let top_map = switch_node_bitmap[top_switch_inx].clone();
    for (i, map) in switch_node_bitmap.iter_mut().enumerate() {
        if i != top_switch_inx {
            map.and_assign(&top_map);
        }
    }

    let start_rem_cpus = rem.rem_cpus;
    let start_rem_max_cpus = rem.rem_max_cpus;
    if let Some(req) = req_map {
        ctx.node_map.and_assign(req);
        if rem.rem_nodes <= 0 && rem.rem_cpus <= 0 && gres_test(ctx.job) {
            // Required nodes completely satisfied the request
            note_leaf_usage(ctx, &switch_node_bitmap, time_waiting);
            return Ok(());
        }
        if ctx.max_nodes == 0 {
            debug!(job = job_id, "required nodes exceed maximum node limit");
            return Err(SelectError::ExhaustedBudget { job_id });
        }
    }

    // Checkpoint for the leaf-count retry loop
    let start_node_map = ctx.node_map.clone();
    let start_switch_required = switch_required.clone();
    let start_switch_node_bitmap = switch_node_bitmap.clone();

    let mut req_nodes_target = ctx.req_nodes;
    loop {
        let attempt = Attempt {
            rem: &mut rem,
            req_nodes_target,
            top_switch_inx,
            gres_per_job,
            req_map,
            switch_node_bitmap: &mut switch_node_bitmap,
            switch_cpu_cnt: &switch_cpu_cnt,
            switch_required: &mut switch_required,
            avail_cpu_per_node: &mut avail_cpu_per_node,
            tiers: &mut tiers,
        };
        let rc = run_attempt(ctx, attempt);

        if ctx.job.req_switch > 0 && rc.is_ok() {
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
                    job = job_id,
                    waited = time_waiting,
                    leaves = leaf_switch_count,
                    "switch wait elapsed, accepting the plan"
                );
            } else if leaf_switch_count > ctx.job.req_switch as i64 {
                // Allocation spans more than the requested switch count
                if req_nodes_target > ctx.min_nodes {
                    req_nodes_target -= 1;
                    rem.rem_nodes = req_nodes_target as i64 - req_node_cnt as i64;
                    rem.min_rem_nodes = ctx.min_nodes as i64 - req_node_cnt as i64;
                    rem.rem_cpus = start_rem_cpus;
                    rem.rem_max_cpus = start_rem_max_cpus;
                    ctx.max_nodes = org_max_nodes.saturating_sub(req_node_cnt);
                    ctx.node_map.copy_from(&start_node_map);
                    switch_required.copy_from_slice(&start_switch_required);
                    avail_cpu_per_node.fill(0);
                    for (map, saved) in switch_node_bitmap
                        .iter_mut()
                        .zip(&start_switch_node_bitmap)
                    {
                        map.copy_from(saved);
                    }
                    debug!(
                        job = job_id,
                        req_nodes = req_nodes_target,
                        "retrying with a smaller preferred node count"
                    );
                    continue;
                }
                ctx.job.best_switch = false;
                trace!(
                    job = job_id,
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
        return rc;
    }
}

/// One allocation attempt at the current preferred node count.
fn run_attempt(ctx: &mut EvalContext<'_>, a: Attempt<'_>) -> Result<(), SelectError> {
    let job_id = ctx.job.job_id;
    let node_cnt = ctx.nodes.len();
    let topo = ctx.topology;
    let switch_cnt = topo.switches.len();
    let Attempt {
        rem,
        req_nodes_target,
        top_switch_inx,
        gres_per_job,
        req_map,
        switch_node_bitmap,
        switch_cpu_cnt,
        switch_required,
        avail_cpu_per_node,
        tiers,
    } = a;

    // Identify the best set of nodes: lowest weights first, all under the
    // common top switch.  Whole tiers are added, so the set usually holds
    // more nodes than needed; later logic narrows it by topology.
    let mut requested = false;
    let mut sufficient = false;
    let mut best_nodes_bitmap = NodeSet::new(node_cnt);
    let mut req2_nodes_bitmap: Option<NodeSet> = None;
    let mut best_gres: Option<GresAvail> = None;
    let mut best_cpu_cnt: i64 = 0;
    let mut best_node_cnt: i64 = 0;

    for tier in tiers.iter_mut() {
        if requested {
            break;
        }
        if best_node_cnt > 0 {
            // Lower weight nodes all join the allocation; this tier only as
            // needed
            match &mut req2_nodes_bitmap {
                Some(req2) => req2.or_assign(&best_nodes_bitmap),
                None => req2_nodes_bitmap = Some(best_nodes_bitmap.clone()),
            }
        }
        if tier.node_map.count() == 0 {
            continue;
        }

        for i in tier.node_map.ones().collect::<Vec<_>>() {
            if req_map.is_some_and(|r| r.test(i)) {
                continue; // required node
            }
            if !switch_node_bitmap[top_switch_inx].test(i) {
                continue;
            }
            select_cores(ctx, i, rem.min_rem_nodes);
            if ctx.avail_cpus == 0 {
                tier.node_map.clear(i);
                continue;
            }
            best_nodes_bitmap.set(i);
            avail_cpu_per_node[i] = ctx.avail_cpus;
            best_cpu_cnt += ctx.avail_cpus as i64;
            best_node_cnt += 1;
            if gres_per_job {
                gres_accumulate(ctx, i, &mut best_gres);
            }
        }

        if !sufficient {
            sufficient = best_cpu_cnt >= rem.rem_cpus
                && enough_nodes(best_node_cnt, rem.rem_nodes, ctx.min_nodes, req_nodes_target);
            if sufficient && gres_per_job {
                sufficient = gres_sufficient(ctx.job, best_gres.as_ref());
            }
        }
        requested = best_node_cnt >= rem.rem_nodes
            && best_cpu_cnt >= rem.rem_cpus
            && (!gres_per_job || gres_sufficient(ctx.job, best_gres.as_ref()));
    }

    debug!(
        job = job_id,
        best_nodes = ?best_nodes_bitmap,
        node_cnt = best_node_cnt,
        cpu_cnt = best_cpu_cnt,
        "best nodes accumulated"
    );
    if !sufficient {
        debug!(job = job_id, "insufficient resources currently available");
        return Err(SelectError::InsufficientPool { job_id });
    }

    // Promote the fully included lower tiers: admitted unconditionally, the
    // job still adds higher weight nodes later as needed
    if let Some(req2) = &req2_nodes_bitmap {
        for i in req2.ones() {
            if ctx.max_nodes == 0 {
                break;
            }
            ctx.avail_cpus = avail_cpu_per_node[i];
            cpus_to_use(ctx, i, rem.rem_max_cpus, rem.min_rem_nodes);
            if gres_per_job {
                gres_add(ctx, i);
            }
            rem.charge(ctx.avail_cpus);
            ctx.max_nodes = ctx.max_nodes.saturating_sub(1);
        }

        for (i, map) in switch_node_bitmap.iter().enumerate() {
            if switch_required[i] {
                continue;
            }
            if req2.overlaps(map) {
                switch_required[i] = true;
            }
        }
        ctx.node_map.or_assign(req2);

        if rem.rem_nodes <= 0 && rem.rem_cpus <= 0 && gres_test(ctx.job) {
            // The promoted tiers alone covered the request; nothing below
            // should have been needed
            error!(job = job_id, "scheduling anomaly");
            return Ok(());
        }
        if ctx.max_nodes == 0 {
            debug!(job = job_id, "reached maximum node limit");
            return Err(SelectError::ExhaustedBudget { job_id });
        }
    }

    // Restrict the per-switch view to the best set
    best_nodes_bitmap.or_assign(ctx.node_map);
    let mut switch_node_cnt = vec![0i64; switch_cnt];
    for i in 0..switch_cnt {
        switch_node_bitmap[i].and_assign(&best_nodes_bitmap);
        switch_node_cnt[i] = switch_node_bitmap[i].count() as i64;
        trace!(
            switch = %topo.switches[i].name,
            level = topo.switches[i].level,
            nodes = switch_node_cnt[i],
            required = switch_required[i],
            speed = topo.switches[i].link_speed,
            "switch state"
        );
    }

    // Top up the leaves already carrying required nodes
    if req_map.is_some() || req2_nodes_bitmap.is_some() {
        for i in 0..switch_cnt {
            if !switch_required[i] || !topo.switches[i].is_leaf() {
                continue;
            }
            for j in switch_node_bitmap[i].ones().collect::<Vec<_>>() {
                if ctx.max_nodes == 0 {
                    break;
                }
                if ctx.node_map.test(j) || avail_cpu_per_node[j] == 0 {
                    continue;
                }
                ctx.avail_cpus = avail_cpu_per_node[j];
                cpus_to_use(ctx, j, rem.rem_max_cpus, rem.min_rem_nodes);
                if gres_per_job {
                    gres_add(ctx, j);
                }
                rem.charge(ctx.avail_cpus);
                ctx.max_nodes = ctx.max_nodes.saturating_sub(1);
                ctx.node_map.set(j);
                if rem.satisfied(ctx.job) {
                    return Ok(());
                }
            }
        }
    }

    // Expand leaf by leaf under the distance metric
    let mut switches_dist = vec![0u32; switch_cnt];
    for i in 0..switch_cnt {
        if switch_required[i] {
            add_dist(&mut switches_dist, topo, i);
        }
    }

    let mut prev_rem_nodes = rem.rem_nodes + 1;
    loop {
        if prev_rem_nodes == rem.rem_nodes {
            break; // stalled
        }
        prev_rem_nodes = rem.rem_nodes;

        let mut best_switch_inx: Option<usize> = None;
        for i in 0..switch_cnt {
            if switch_required[i] || !topo.switches[i].is_leaf() {
                continue;
            }
            choose_best_switch(
                &switches_dist,
                &switch_node_cnt,
                rem.rem_nodes,
                switch_cpu_cnt,
                rem.rem_cpus,
                topo,
                i,
                &mut best_switch_inx,
            );
        }
        let Some(best_switch_inx) = best_switch_inx else {
            break;
        };
        add_dist(&mut switches_dist, topo, best_switch_inx);

        // Nodes join in bitmap order, not resource order
        for i in switch_node_bitmap[best_switch_inx]
            .ones()
            .collect::<Vec<_>>()
        {
            if ctx.max_nodes == 0 {
                break;
            }
            if ctx.node_map.test(i) || avail_cpu_per_node[i] == 0 {
                continue;
            }
            ctx.avail_cpus = avail_cpu_per_node[i];
            cpus_to_use(ctx, i, rem.rem_max_cpus, rem.min_rem_nodes);
            if gres_per_job {
                gres_add(ctx, i);
            }
            rem.charge(ctx.avail_cpus);
            ctx.max_nodes = ctx.max_nodes.saturating_sub(1);
            ctx.node_map.set(i);
            if rem.satisfied(ctx.job) {
                return Ok(());
            }
        }
        switch_node_cnt[best_switch_inx] = 0; // used all
    }

    if rem.min_satisfied(ctx.job) {
        return Ok(());
    }
    Err(SelectError::InsufficientPool { job_id })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::super::test_support::Fixture;
    use super::super::SelectError;
    use super::*;
    use crate::config::EvalConfig;
    use assert_matches::assert_matches;
    use crate::topology::SwitchRecord;

    #[test]
    fn job_fits_on_one_leaf() {
        let mut fx = Fixture::uniform(8, 4);
        fx.set_tree_topology(&[&[0, 1, 2, 3], &[4, 5, 6, 7]]);
        fx.min_nodes = 2;
        fx.req_nodes = 2;
        fx.job.details.min_cpus = 8;
        fx.evaluate(EvalConfig::default()).unwrap();
        assert_eq!(fx.selected(), vec![0, 1]);
    }

    #[test]
    fn lowest_weight_tier_steers_the_leaf_choice() {
        let mut fx = Fixture::with_weights(4, &[2, 2, 2, 2, 1, 1, 1, 1]);
        fx.set_tree_topology(&[&[0, 1, 2, 3], &[4, 5, 6, 7]]);
        fx.min_nodes = 2;
        fx.req_nodes = 2;
        fx.job.details.min_cpus = 8;
        fx.evaluate(EvalConfig::default()).unwrap();
        assert_eq!(fx.selected(), vec![4, 5]);
    }

    #[test]
    fn required_nodes_spanning_two_leaves_use_the_root() {
        let mut fx = Fixture::uniform(8, 4);
        fx.set_tree_topology(&[&[0, 1, 2, 3], &[4, 5, 6, 7]]);
        fx.min_nodes = 2;
        fx.req_nodes = 2;
        fx.job.details.min_cpus = 2;
        fx.job.details.req_node_bitmap = Some(NodeSet::from_indices(8, &[0, 4]));
        fx.evaluate(EvalConfig::default()).unwrap();
        assert_eq!(fx.selected(), vec![0, 4]);
    }

    #[test]
    fn spanning_required_set_defers_or_accepts_on_wait() {
        // Leaf count 2 with req_switch 1: before the wait elapses the plan is
        // marked deferrable, afterwards it is accepted.
        let mut fx = Fixture::uniform(8, 4);
        fx.set_tree_topology(&[&[0, 1, 2, 3], &[4, 5, 6, 7]]);
        fx.min_nodes = 2;
        fx.req_nodes = 2;
        fx.job.details.min_cpus = 2;
        fx.job.details.req_node_bitmap = Some(NodeSet::from_indices(8, &[0, 4]));
        fx.job.req_switch = 1;
        fx.job.wait4switch = 300;
        fx.time_now = 1_000;
        fx.evaluate(EvalConfig::default()).unwrap();
        assert_eq!(fx.selected(), vec![0, 4]);
        assert!(!fx.job.best_switch);

        let mut fx = Fixture::uniform(8, 4);
        fx.set_tree_topology(&[&[0, 1, 2, 3], &[4, 5, 6, 7]]);
        fx.min_nodes = 2;
        fx.req_nodes = 2;
        fx.job.details.min_cpus = 2;
        fx.job.details.req_node_bitmap = Some(NodeSet::from_indices(8, &[0, 4]));
        fx.job.req_switch = 1;
        fx.job.wait4switch = 300;
        fx.job.wait4switch_start = 500;
        fx.time_now = 1_000;
        fx.evaluate(EvalConfig::default()).unwrap();
        assert!(fx.job.best_switch);
    }

    #[test]
    fn leaf_count_restart_shrinks_to_the_preferred_minimum() {
        // Preferring 3 nodes spans two leaves of two; the retry drops the
        // preference to 2 and the job fits a single leaf.
        let mut fx = Fixture::uniform(4, 1);
        fx.set_tree_topology(&[&[0, 1], &[2, 3]]);
        fx.min_nodes = 2;
        fx.req_nodes = 3;
        fx.job.details.min_cpus = 2;
        fx.job.req_switch = 1;
        fx.job.wait4switch = 300;
        fx.time_now = 1_000;
        fx.evaluate(EvalConfig::default()).unwrap();
        assert_eq!(fx.selected(), vec![0, 1]);
        assert!(fx.job.best_switch);
    }

    #[test]
    fn disjoint_required_set_without_shared_switch_fails() {
        // Two stand-alone leaves, no common ancestor.
        let mut fx = Fixture::uniform(8, 4);
        let leaf = |name: &str, inx: usize, members: &[usize]| SwitchRecord {
            name: name.into(),
            level: 0,
            parent: inx,
            node_bitmap: NodeSet::from_indices(8, members),
            switches_dist: vec![0, INFINITE_DIST],
            link_speed: 100,
        };
        fx.topology.switches = vec![leaf("s0", 0, &[0, 1, 2, 3]), leaf("s1", 1, &[4, 5, 6, 7])];
        fx.topology.switches[1].switches_dist = vec![INFINITE_DIST, 0];
        fx.min_nodes = 2;
        fx.req_nodes = 2;
        fx.job.details.min_cpus = 2;
        fx.job.details.req_node_bitmap = Some(NodeSet::from_indices(8, &[0, 4]));
        let err = fx.evaluate(EvalConfig::default()).unwrap_err();
        assert_matches!(err, SelectError::TopologySplit { .. });
        assert_eq!(fx.selected(), vec![0, 4]);
    }

    #[test]
    fn insufficient_pool_reduces_to_required() {
        let mut fx = Fixture::uniform(4, 2);
        fx.set_tree_topology(&[&[0, 1], &[2, 3]]);
        fx.min_nodes = 2;
        fx.req_nodes = 2;
        fx.job.details.min_cpus = 50;
        fx.job.details.req_node_bitmap = Some(NodeSet::from_indices(4, &[1]));
        let err = fx.evaluate(EvalConfig::default()).unwrap_err();
        assert_matches!(err, SelectError::InsufficientPool { .. });
        assert_eq!(fx.selected(), vec![1]);
    }

    #[test]
    fn distance_metric_prefers_the_closer_leaf() {
        // Three leaves under one root; the required node sits on leaf 0.
        // Leaf 1 is 2 hops away, leaf 2 is 4 hops away: expansion must take
        // leaf 1 first.
        let mut fx = Fixture::uniform(6, 1);
        fx.set_tree_topology(&[&[0, 1], &[2, 3], &[4, 5]]);
        // Make leaf 2 farther from leaf 0 than leaf 1 is.
        fx.topology.switches[0].switches_dist = vec![0, 2, 4, 1];
        fx.topology.switches[1].switches_dist = vec![2, 0, 4, 1];
        fx.topology.switches[2].switches_dist = vec![4, 4, 0, 1];
        fx.min_nodes = 4;
        fx.req_nodes = 4;
        fx.job.details.min_cpus = 4;
        fx.job.details.req_node_bitmap = Some(NodeSet::from_indices(6, &[0]));
        fx.evaluate(EvalConfig::default()).unwrap();
        assert_eq!(fx.selected(), vec![0, 1, 2, 3]);
    }

    // ── compare_switches / choose_best_switch ─────────────────────────────────

    fn three_leaf_topology() -> crate::topology::Topology {
        let mut fx = Fixture::uniform(6, 1);
        fx.set_tree_topology(&[&[0, 1], &[2, 3], &[4, 5]]);
        fx.topology
    }

    #[test]
    fn fitting_switch_beats_larger_non_fitting_one() {
        let topo = three_leaf_topology();
        let node_cnt = [2i64, 1, 2, 5];
        let cpu_cnt = [2i64, 1, 2, 5];
        // Switch 0 fits (2 nodes, 2 cpus); switch 1 does not.
        assert_eq!(compare_switches(0, 1, 2, &node_cnt, 2, &cpu_cnt, &topo), 1);
        assert_eq!(compare_switches(1, 0, 2, &node_cnt, 2, &cpu_cnt, &topo), -1);
    }

    #[test]
    fn tightest_fit_wins_between_two_fitting_switches() {
        let topo = three_leaf_topology();
        let node_cnt = [2i64, 1, 2, 5];
        let cpu_cnt = [2i64, 1, 2, 5];
        // Both switches 0 and 2 fit one node; equal size ties at 0...
        assert_eq!(compare_switches(0, 2, 1, &node_cnt, 1, &cpu_cnt, &topo), 0);
        // ...but a smaller fitting switch beats a bigger one.
        assert_eq!(compare_switches(1, 0, 1, &node_cnt, 1, &cpu_cnt, &topo), 1);
    }

    #[test]
    fn choose_best_switch_respects_distance_first() {
        let topo = three_leaf_topology();
        let node_cnt = [2i64, 2, 2, 6];
        let cpu_cnt = [2i64, 2, 2, 6];
        let dist = [4u32, 2, INFINITE_DIST, 1];
        let mut best = None;
        for i in 0..3 {
            choose_best_switch(&dist, &node_cnt, 2, &cpu_cnt, 2, &topo, i, &mut best);
        }
        // Unreachable leaf 2 is skipped; leaf 1 is closer than leaf 0.
        assert_eq!(best, Some(1));
    }
}
