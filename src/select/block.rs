/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Hierarchical-block strategy: confine the job to one block of base-blocks.
//!
//! The base-block table is grouped into blocks of a power-of-two number of
//! base-blocks — the smallest legal exponent covering the node demand, taken
//! from the layout's allowed set.  One block is chosen (the one holding the
//! required nodes, else the one with the lowest-weight candidates), every
//! required node must live inside it, and the block is then filled greedily
//! base-block by base-block, tightest sufficient base-block first.

use tracing::{debug, error, info, trace};

use super::{
    build_weight_tiers, cpus_to_use, enough_nodes, gres_accumulate, gres_add, gres_init,
    gres_sufficient, gres_test, log_weight_tiers, reduce_to_required, select_cores, EvalContext,
    Remainders, SelectError,
};
use crate::bitmap::NodeSet;
use crate::gres::GresAvail;
use crate::topology::BlockLayout;

/// Base-blocks per block and resulting block count for a node demand.
///
/// The naive exponent `⌈log2⌈rem_nodes / bblock_node_cnt⌉⌉` is snapped up to
/// the next allowed grouping exponent; with no legal exponent the whole
/// table forms a single block.
fn bblock_grouping(layout: &BlockLayout, rem_nodes: i64) -> (usize, usize) {
    let bblock_node_cnt = layout.bblock_node_cnt.max(1) as i64;
    let naive = ((rem_nodes.max(1) + bblock_node_cnt - 1) / bblock_node_cnt) as u32;
    let exponent = naive.next_power_of_two().trailing_zeros();
    match layout.next_level_from(exponent) {
        Some(allowed) => {
            let per_block = 1usize << allowed;
            let block_cnt = layout.records.len().div_ceil(per_block);
            (per_block, block_cnt)
        }
        None => (layout.records.len().max(1), 1),
    }
}

pub(crate) fn eval(ctx: &mut EvalContext<'_>) -> Result<(), SelectError> {
    let req_map = ctx.job.details.req_node_bitmap.clone();
    let rc = block_inner(ctx, req_map.as_ref());
    if rc.is_err() {
        reduce_to_required(ctx.node_map, req_map.as_ref());
    }
    rc
}

fn block_inner(ctx: &mut EvalContext<'_>, req_map: Option<&NodeSet>) -> Result<(), SelectError> {
    let job_id = ctx.job.job_id;
    let node_cnt = ctx.nodes.len();
    let topo = ctx.topology;
    let Some(layout) = topo.blocks.as_ref() else {
        return Err(SelectError::NoUsableBlock { job_id });
    };
    let block_record_cnt = layout.records.len();
    ctx.avail_cpus = 0;

    let gres_per_job = gres_init(ctx.job);
    // The node target always follows the minimum here
    let mut rem = Remainders::new_min(&ctx.job.details, ctx.min_nodes, ctx.req_nodes);

    let (bblock_per_block, block_cnt) = bblock_grouping(layout, rem.rem_nodes);
    debug!(
        job = job_id,
        bblock_per_block,
        rem_nodes = rem.rem_nodes,
        "block grouping resolved"
    );

    // Validate availability of required nodes
    if let Some(req) = req_map {
        if !layout.nodes_bitmap.is_superset(req) {
            info!(job = job_id, "requires nodes which are not in blocks");
            return Err(SelectError::RequiredUnavailable { job_id });
        }
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

    // Aggregate base-blocks into blocks
    let mut bblock_block_inx = vec![0usize; block_record_cnt];
    let mut block_node_bitmap: Vec<NodeSet> = Vec::with_capacity(block_cnt);
    for i in 0..block_record_cnt {
        let block = i / bblock_per_block;
        bblock_block_inx[i] = block;
        if block == block_node_bitmap.len() {
            block_node_bitmap.push(layout.records[i].node_bitmap.clone());
        } else {
            block_node_bitmap[block].or_assign(&layout.records[i].node_bitmap);
        }
    }

    // Pick the block: required overlap wins outright, else the block whose
    // candidates hold the lowest-weight tier, smaller block on ties
    let mut block_inx: Option<usize> = None;
    let mut block_lowest_weight = u64::MAX;
    let mut block_node_cnt = vec![0i64; block_cnt];
    for b in 0..block_node_bitmap.len() {
        block_node_bitmap[b].and_assign(ctx.node_map);
        block_node_cnt[b] = block_node_bitmap[b].count() as i64;
        let block_cpus: i64 = block_node_bitmap[b]
            .ones()
            .map(|j| ctx.avail_res[j].avail_cpus as i64)
            .sum();
        if let Some(req) = req_map {
            if req.overlaps(&block_node_bitmap[b]) && block_inx.is_none() {
                block_inx = Some(b);
                break;
            }
        }
        if !enough_nodes(block_node_cnt[b], rem.rem_nodes, ctx.min_nodes, ctx.req_nodes)
            || rem.rem_cpus > block_cpus
        {
            continue;
        }
        if req_map.is_none() {
            if let Some(tier) = tiers
                .iter()
                .find(|t| t.node_map.overlaps(&block_node_bitmap[b]))
            {
                if block_inx.is_none()
                    || tier.weight < block_lowest_weight
                    || (tier.weight == block_lowest_weight
                        && block_node_cnt[b] <= block_node_cnt[block_inx.unwrap()])
                {
                    block_inx = Some(b);
                    block_lowest_weight = tier.weight;
                }
            }
        }
    }

    if req_map.is_none() {
        ctx.node_map.clear_all();
    }

    let Some(block_inx) = block_inx else {
        debug!(job = job_id, "unable to find block");
        return Err(SelectError::NoUsableBlock { job_id });
    };

    // All specifically required nodes must share one block
    if let Some(req) = req_map {
        if !block_node_bitmap[block_inx].is_superset(req) {
            info!(job = job_id, "requires nodes that do not have a shared block");
            return Err(SelectError::TopologySplit {
                job_id,
                region: "block",
            });
        }
    }

    let mut bblock_required = vec![false; block_record_cnt];
    if let Some(req) = req_map {
        ctx.node_map.and_assign(req);
        if rem.rem_nodes <= 0 && rem.rem_cpus <= 0 && gres_test(ctx.job) {
            // Required nodes completely satisfied the request
            return Ok(());
        }
        if ctx.max_nodes == 0 {
            info!(job = job_id, "required nodes exceed maximum node limit");
            return Err(SelectError::ExhaustedBudget { job_id });
        }
        for i in 0..block_record_cnt {
            if bblock_block_inx[i] != block_inx {
                continue;
            }
            if req.overlaps(&layout.records[i].node_bitmap) {
                bblock_required[i] = true;
            }
        }
    }

    // Best set: weight tiers ascending, restricted to the chosen block
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
            if !block_node_bitmap[block_inx].test(i) {
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
                && enough_nodes(best_node_cnt, rem.rem_nodes, ctx.min_nodes, ctx.req_nodes);
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

    // Promote the fully included lower tiers
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

        ctx.node_map.or_assign(req2);

        if rem.rem_nodes <= 0 && rem.rem_cpus <= 0 && gres_test(ctx.job) {
            // The promoted tiers alone covered the request
            error!(job = job_id, "scheduling anomaly");
            return Ok(());
        }
        if ctx.max_nodes == 0 {
            debug!(job = job_id, "reached maximum node limit");
            return Err(SelectError::ExhaustedBudget { job_id });
        }
        for i in 0..block_record_cnt {
            if bblock_block_inx[i] != block_inx || bblock_required[i] {
                continue;
            }
            if req2.overlaps(&layout.records[i].node_bitmap) {
                bblock_required[i] = true;
            }
        }
    }

    // Top up base-blocks already carrying required nodes
    if req_map.is_some() || req2_nodes_bitmap.is_some() {
        for i in 0..block_record_cnt {
            if !bblock_required[i] {
                continue;
            }
            let mut bblock_bitmap = layout.records[i].node_bitmap.clone();
            bblock_bitmap.and_assign(&block_node_bitmap[block_inx]);
            bblock_bitmap.and_assign(&best_nodes_bitmap);
            bblock_bitmap.and_not_assign(ctx.node_map);

            for j in bblock_bitmap.ones() {
                if ctx.max_nodes == 0 {
                    break;
                }
                if avail_cpu_per_node[j] == 0 {
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

    // Candidate sets of the still-unused base-blocks in the chosen block
    let mut bblock_node_bitmap: Vec<Option<NodeSet>> = vec![None; block_record_cnt];
    let mut nodes_on_bblock = vec![0i64; block_record_cnt];
    for i in 0..block_record_cnt {
        if bblock_block_inx[i] != block_inx || bblock_required[i] {
            continue;
        }
        let mut members = layout.records[i].node_bitmap.clone();
        members.and_assign(&block_node_bitmap[block_inx]);
        members.and_assign(&best_nodes_bitmap);
        nodes_on_bblock[i] = members.count() as i64;
        bblock_node_bitmap[i] = Some(members);
    }

    // Greedy fill: tightest base-block that still covers the demand, else
    // the largest, until the demand is met or progress stalls
    let mut prev_rem_nodes = rem.rem_nodes + 1;
    loop {
        if prev_rem_nodes == rem.rem_nodes {
            break; // stalled
        }
        prev_rem_nodes = rem.rem_nodes;

        let mut best_bblock_inx: Option<usize> = None;
        let mut best_fit = false;
        for i in 0..block_record_cnt {
            if bblock_block_inx[i] != block_inx || bblock_required[i] {
                continue;
            }
            let fit = nodes_on_bblock[i] >= rem.rem_nodes;
            let new_best = match best_bblock_inx {
                None => true,
                Some(best) => {
                    (fit && !best_fit)
                        || (!fit && !best_fit && nodes_on_bblock[i] > nodes_on_bblock[best])
                        || (fit && nodes_on_bblock[i] <= nodes_on_bblock[best])
                }
            };
            if new_best {
                best_bblock_inx = Some(i);
                best_fit = fit;
            }
        }
        trace!(
            job = job_id,
            rem_nodes = rem.rem_nodes,
            best_bblock = ?best_bblock_inx,
            "base-block fill step"
        );
        let Some(best_bblock_inx) = best_bblock_inx else {
            break;
        };

        let Some(mut members) = bblock_node_bitmap[best_bblock_inx].take() else {
            break;
        };
        members.and_not_assign(ctx.node_map);
        bblock_required[best_bblock_inx] = true;
        // Nodes join in bitmap order, not resource order
        for i in members.ones() {
            if ctx.max_nodes == 0 {
                break;
            }
            if avail_cpu_per_node[i] == 0 {
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
    use assert_matches::assert_matches;
    use crate::topology::BlockRecord;

    fn layout(bblock_node_cnt: u32, block_levels: u16, bblocks: usize) -> BlockLayout {
        let n = bblock_node_cnt as usize * bblocks;
        BlockLayout {
            records: (0..bblocks)
                .map(|b| BlockRecord {
                    name: format!("bb{b}"),
                    node_bitmap: NodeSet::from_indices(
                        n,
                        &(b * bblock_node_cnt as usize..(b + 1) * bblock_node_cnt as usize)
                            .collect::<Vec<_>>(),
                    ),
                })
                .collect(),
            block_levels,
            bblock_node_cnt,
            nodes_bitmap: NodeSet::from_indices(n, &(0..n).collect::<Vec<_>>()),
        }
    }

    // ── bblock_grouping ───────────────────────────────────────────────────────

    #[test]
    fn grouping_snaps_up_to_the_allowed_exponent() {
        // 4 nodes per base-block, exponents 1 and 3 allowed, 5 nodes wanted:
        // naive exponent ⌈log2⌈5/4⌉⌉ = 1 is legal, so 2 base-blocks per block.
        let l = layout(4, 0b1010, 8);
        let (per_block, block_cnt) = bblock_grouping(&l, 5);
        assert_eq!(per_block, 2);
        assert_eq!(block_cnt, 4);
    }

    #[test]
    fn grouping_skips_disallowed_exponents() {
        // Demand needs exponent 2, only 3 is allowed: 8 base-blocks per block.
        let l = layout(4, 0b1000, 8);
        let (per_block, block_cnt) = bblock_grouping(&l, 16);
        assert_eq!(per_block, 8);
        assert_eq!(block_cnt, 1);
    }

    #[test]
    fn grouping_without_legal_exponent_uses_one_block() {
        let l = layout(4, 0, 8);
        let (per_block, block_cnt) = bblock_grouping(&l, 4);
        assert_eq!(per_block, 8);
        assert_eq!(block_cnt, 1);
    }

    #[test]
    fn grouping_handles_zero_demand() {
        let l = layout(4, 0b0001, 8);
        let (per_block, _) = bblock_grouping(&l, 0);
        assert_eq!(per_block, 1);
    }

    // ── End-to-end ────────────────────────────────────────────────────────────

    #[test]
    fn job_lands_inside_a_single_block() {
        let mut fx = Fixture::uniform(8, 2);
        fx.set_block_topology(2, 0b0001);
        fx.min_nodes = 2;
        fx.req_nodes = 2;
        fx.job.details.min_cpus = 4;
        fx.evaluate_default().unwrap();
        // Equal-weight blocks tie toward the later one of equal size.
        assert_eq!(fx.selected(), vec![6, 7]);
    }

    #[test]
    fn required_node_pins_the_block() {
        let mut fx = Fixture::uniform(8, 2);
        fx.set_block_topology(2, 0b0001);
        fx.min_nodes = 2;
        fx.req_nodes = 2;
        fx.job.details.min_cpus = 4;
        fx.job.details.req_node_bitmap = Some(NodeSet::from_indices(8, &[2]));
        fx.evaluate_default().unwrap();
        assert_eq!(fx.selected(), vec![2, 3]);
    }

    #[test]
    fn required_nodes_split_across_blocks_fail() {
        let mut fx = Fixture::uniform(8, 2);
        fx.set_block_topology(2, 0b0001);
        fx.min_nodes = 2;
        fx.req_nodes = 2;
        fx.job.details.min_cpus = 4;
        fx.job.details.req_node_bitmap = Some(NodeSet::from_indices(8, &[0, 7]));
        let err = fx.evaluate_default().unwrap_err();
        assert_matches!(err, SelectError::TopologySplit { region: "block", .. });
        assert_eq!(fx.selected(), vec![0, 7]);
    }

    #[test]
    fn five_node_job_fills_a_grouped_block() {
        let mut fx = Fixture::uniform(16, 1);
        fx.set_block_topology(4, 0b1010); // exponents 1 and 3 → 8-node blocks
        fx.min_nodes = 5;
        fx.req_nodes = 5;
        fx.job.details.min_cpus = 5;
        fx.evaluate_default().unwrap();
        let selected = fx.selected();
        assert_eq!(selected.len(), 5);
        assert!(
            selected.iter().all(|&i| i >= 8),
            "selection must stay inside one 8-node block, got {selected:?}"
        );
    }

    #[test]
    fn oversized_demand_fails_with_an_empty_map() {
        // No block offers 100 CPUs, so no block can be chosen at all.
        let mut fx = Fixture::uniform(8, 2);
        fx.set_block_topology(2, 0b0001);
        fx.min_nodes = 2;
        fx.req_nodes = 2;
        fx.job.details.min_cpus = 100;
        let err = fx.evaluate_default().unwrap_err();
        assert_matches!(err, SelectError::NoUsableBlock { .. });
        assert_eq!(fx.selected(), Vec::<usize>::new());
    }

    #[test]
    fn required_node_outside_the_block_layout_fails() {
        let mut fx = Fixture::uniform(10, 2);
        // Only the first 8 nodes belong to blocks.
        fx.set_block_topology(2, 0b0001);
        if let Some(blocks) = &mut fx.topology.blocks {
            let mut shrunk = NodeSet::new(10);
            for i in 0..8 {
                shrunk.set(i);
            }
            blocks.nodes_bitmap = shrunk;
        }
        fx.job.details.min_cpus = 2;
        fx.job.details.req_node_bitmap = Some(NodeSet::from_indices(10, &[9]));
        let err = fx.evaluate_default().unwrap_err();
        assert_matches!(err, SelectError::RequiredUnavailable { .. });
    }
}
