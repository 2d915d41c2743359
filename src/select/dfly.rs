/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Dragonfly strategy: allocate on one leaf switch if possible, otherwise
//! distribute over many leaves round-robin, one node per leaf per pass.
//!
//! Dragonfly fabrics make the all-to-all distance between groups uniform, so
//! the distance-ranked leaf expansion of the general tree strategy buys
//! nothing; either the job fits under a single leaf or it is spread evenly.

use tracing::{debug, error, info, trace, warn};

use super::{
    build_weight_tiers, cpus_to_use, enough_nodes, gres_accumulate, gres_add, gres_init,
    gres_sufficient, gres_test, log_weight_tiers, note_leaf_usage, reduce_to_required,
    select_cores, EvalContext, Remainders, SelectError,
};
use crate::bitmap::NodeSet;
use crate::gres::GresAvail;

pub(crate) fn eval(ctx: &mut EvalContext<'_>) -> Result<(), SelectError> {
    let req_map = ctx.job.details.req_node_bitmap.clone();
    let rc = dfly_inner(ctx, req_map.as_ref());
    if rc.is_err() {
        reduce_to_required(ctx.node_map, req_map.as_ref());
    }
    rc
}

fn dfly_inner(ctx: &mut EvalContext<'_>, req_map: Option<&NodeSet>) -> Result<(), SelectError> {
    let job_id = ctx.job.job_id;
    let node_cnt = ctx.nodes.len();
    let topo = ctx.topology;
    let switch_cnt = topo.switches.len();
    ctx.avail_cpus = 0;

    if ctx.job.req_switch > 1 {
        // A leaf switch ceiling above one makes no sense on a dragonfly
        warn!(
            job = job_id,
            from = ctx.job.req_switch,
            "resetting leaf switch count to 0"
        );
        ctx.job.req_switch = 0;
    }
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

    if let Some(req) = req_map {
        let req_node_cnt = req.count() as u32;
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
                debug!(
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

    if let Some(req) = req_map {
        ctx.node_map.and_assign(req);
        if rem.rem_nodes <= 0 && rem.rem_cpus <= 0 && gres_test(ctx.job) {
            // Required nodes completely satisfied the request
            return Ok(());
        }
        if ctx.max_nodes == 0 {
            debug!(job = job_id, "required nodes exceed maximum node limit");
            return Err(SelectError::ExhaustedBudget { job_id });
        }
    } else {
        ctx.node_map.clear_all();
    }
    log_weight_tiers(&tiers);

    // Identify the top switch: highest level containing all required nodes,
    // or the highest level with any candidate.  Nodes can sit on multiple
    // non-overlapping switches.
    let mut switch_node_bitmap: Vec<NodeSet> =
        topo.switches.iter().map(|s| s.node_bitmap.clone()).collect();
    let mut switch_node_cnt = vec![0i64; switch_cnt];
    let mut switch_required = vec![false; switch_cnt];
    let mut leaf_switch_count: i64 = 0;
    let mut top_switch_inx: Option<usize> = None;

    for (i, sw) in topo.switches.iter().enumerate() {
        if let Some(req) = req_map {
            if req.overlaps(&switch_node_bitmap[i]) {
                switch_required[i] = true;
                if sw.is_leaf() {
                    leaf_switch_count += 1;
                }
                if top_switch_inx.is_none_or(|t| sw.level > topo.switches[t].level) {
                    top_switch_inx = Some(i);
                }
            }
        } else if tiers.iter().any(|t| t.node_map.overlaps(&switch_node_bitmap[i]))
            && top_switch_inx.is_none_or(|t| sw.level > topo.switches[t].level)
        {
            top_switch_inx = Some(i);
        }
    }

    let Some(top_switch_inx) = top_switch_inx else {
        error!(job = job_id, "unable to identify top level switch");
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

    // Best set: weight tiers ascending until the demand is reachable.  Fully
    // consumed lower tiers get promoted to unconditional admission.
    let mut best_nodes_bitmap = NodeSet::new(node_cnt);
    let mut req2_nodes_bitmap: Option<NodeSet> = None;
    let mut best_gres: Option<GresAvail> = None;
    let mut best_cpu_cnt: i64 = 0;
    let mut best_node_cnt: i64 = 0;
    let mut sufficient = false;

    for tier in &mut tiers {
        if sufficient {
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
        for i in tier.node_map.ones().collect::<Vec<_>>() {
            if avail_cpu_per_node[i] != 0 {
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

        sufficient = best_cpu_cnt >= rem.rem_cpus
            && enough_nodes(best_node_cnt, rem.rem_nodes, ctx.min_nodes, ctx.req_nodes);
        if sufficient && gres_per_job {
            sufficient = gres_sufficient(ctx.job, best_gres.as_ref());
        }
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

    // Admit the promoted low-weight tiers unconditionally
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

        for (i, sw) in topo.switches.iter().enumerate() {
            if switch_required[i] {
                continue;
            }
            if req2.overlaps(&switch_node_bitmap[i]) {
                switch_required[i] = true;
                if sw.is_leaf() {
                    leaf_switch_count += 1;
                }
            }
        }
        ctx.node_map.or_assign(req2);
        if ctx.max_nodes == 0 {
            debug!(job = job_id, "reached maximum node limit");
            return Err(SelectError::ExhaustedBudget { job_id });
        }
        if rem.rem_nodes <= 0 && rem.rem_cpus <= 0 && gres_test(ctx.job) {
            // The promoted tiers alone covered the request; nothing below
            // should have been needed
            error!(job = job_id, "scheduling anomaly");
            note_leaf_usage(ctx, &switch_node_bitmap, time_waiting);
            return Ok(());
        }
    }

    // Restrict the per-switch view to the best set
    best_nodes_bitmap.or_assign(ctx.node_map);
    let mut avail_nodes_bitmap = NodeSet::new(node_cnt);
    for i in 0..switch_cnt {
        switch_node_bitmap[i].and_assign(&best_nodes_bitmap);
        avail_nodes_bitmap.or_assign(&switch_node_bitmap[i]);
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

    if let Some(req) = req_map {
        if !avail_nodes_bitmap.is_superset(req) {
            info!(job = job_id, "requires nodes not available on any switch");
            return Err(SelectError::RequiredUnavailable { job_id });
        }
    }

    // Nothing selected yet: start from the leaf with the most candidates
    if leaf_switch_count == 0 {
        let mut best_leaf: Option<usize> = None;
        for (i, sw) in topo.switches.iter().enumerate() {
            if !sw.is_leaf() {
                continue;
            }
            if best_leaf.is_none_or(|b| switch_node_cnt[i] > switch_node_cnt[b]) {
                best_leaf = Some(i);
            }
        }
        if let Some(best_leaf) = best_leaf {
            leaf_switch_count = 1;
            switch_required[best_leaf] = true;
        }
    }

    // One leaf holds everything required so far: try to complete from it
    if leaf_switch_count == 1 {
        best_cpu_cnt = 0;
        best_node_cnt = 0;
        best_gres = None;
        let mut the_leaf: Option<usize> = None;
        for i in 0..switch_cnt {
            if !switch_required[i] || !topo.switches[i].is_leaf() {
                continue;
            }
            for j in switch_node_bitmap[i].ones() {
                if ctx.node_map.test(j) || avail_cpu_per_node[j] == 0 {
                    continue;
                }
                best_cpu_cnt += avail_cpu_per_node[j] as i64;
                best_node_cnt += 1;
                if gres_per_job {
                    gres_accumulate(ctx, j, &mut best_gres);
                }
            }
            the_leaf = Some(i);
            break;
        }

        let mut leaf_sufficient = best_cpu_cnt >= rem.rem_cpus
            && enough_nodes(best_node_cnt, rem.rem_nodes, ctx.min_nodes, ctx.req_nodes);
        if leaf_sufficient && gres_per_job {
            leaf_sufficient = gres_sufficient(ctx.job, best_gres.as_ref());
        }
        if leaf_sufficient {
            if let Some(leaf) = the_leaf {
                for j in switch_node_bitmap[leaf].ones().collect::<Vec<_>>() {
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
                        note_leaf_usage(ctx, &switch_node_bitmap, time_waiting);
                        return Ok(());
                    }
                    if ctx.max_nodes == 0 {
                        debug!(job = job_id, "reached maximum node limit");
                        return Err(SelectError::ExhaustedBudget { job_id });
                    }
                }
            }
        }
    }

    // Round-robin the leaves: one node per leaf per pass
    let mut prev_rem_nodes = rem.rem_nodes + 1;
    loop {
        if prev_rem_nodes == rem.rem_nodes {
            break; // stalled
        }
        prev_rem_nodes = rem.rem_nodes;
        for i in 0..switch_cnt {
            if !topo.switches[i].is_leaf() {
                continue;
            }
            for j in switch_node_bitmap[i].ones().collect::<Vec<_>>() {
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
                    note_leaf_usage(ctx, &switch_node_bitmap, time_waiting);
                    return Ok(());
                }
                if ctx.max_nodes == 0 {
                    debug!(job = job_id, "reached maximum node limit");
                    return Err(SelectError::ExhaustedBudget { job_id });
                }
                break; // move to the next switch
            }
        }
    }

    if rem.min_satisfied(ctx.job) {
        note_leaf_usage(ctx, &switch_node_bitmap, time_waiting);
        return Ok(());
    }
    Err(SelectError::InsufficientPool { job_id })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
