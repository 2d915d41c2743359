/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! The four weight-tier strategies: busy, lln, serial and spread.
//!
//! All four share one skeleton: admit the required nodes, clear every
//! non-required candidate bit, group the remaining candidates by scheduling
//! weight, then walk the tiers in ascending weight order.  They differ only
//! in how a tier is consumed:
//!
//! * **busy**   — two sub-passes per tier: first nodes that already run jobs,
//!   then idle ones.
//! * **lln**    — repeatedly take the node with the greatest
//!   available-to-total CPU ratio (integer cross-product compare).
//! * **serial** — walk indexes high → low, packing serial jobs at the end of
//!   the node table.
//! * **spread** — walk indexes low → high and keep admitting until the node
//!   budget runs out, using as many nodes as possible.
//!
//! On any failure the candidate map is cleared entirely.

use tracing::{debug, trace};

use super::{
    build_weight_tiers, cpus_to_use, gres_add, gres_init, gres_test, log_weight_tiers,
    select_cores, EvalContext, Remainders, SelectError, WeightTier,
};

// ── Shared skeleton ───────────────────────────────────────────────────────────

/// Prologue state shared by the four strategies.
struct Prep {
    rem: Remainders,
    gres_per_job: bool,
    total_cpus: i64,
    /// Lowest / highest candidate index on entry.
    span: Option<(usize, usize)>,
    tiers: Vec<WeightTier>,
    /// The required nodes alone satisfied the whole request.
    done: bool,
}

/// Required-node admission and weight grouping.
///
/// Mutates `ctx.node_map` down to the admitted required set (or clears it
/// when the job requires none); the returned tiers cover the remaining
/// candidates.
fn prepare(ctx: &mut EvalContext<'_>) -> Result<Prep, SelectError> {
    let job_id = ctx.job.job_id;
    ctx.avail_cpus = 0;

    if let Some(num_tasks) = ctx.job.details.num_tasks.filter(|&n| n > 0) {
        ctx.max_nodes = ctx.max_nodes.min(num_tasks);
    }

    let gres_per_job = gres_init(ctx.job);
    let mut rem = Remainders::new(
        &ctx.job.details,
        ctx.min_nodes,
        ctx.req_nodes,
        gres_per_job,
    );

    let span = match (ctx.node_map.first_set(), ctx.node_map.last_set()) {
        (Some(s), Some(e)) => Some((s, e)),
        _ => None,
    };

    let req_map = ctx.job.details.req_node_bitmap.clone();
    let mut orig_node_map = ctx.node_map.clone();
    let mut total_cpus: i64 = 0;
    let mut done = false;

    if let Some(req_map) = &req_map {
        if let Some((i_start, i_end)) = span {
            for i in i_start..=i_end {
                if !req_map.test(i) {
                    ctx.node_map.clear(i);
                    continue;
                }
                if ctx.avail_res[i].avail_cpus == 0 {
                    debug!(
                        job = job_id,
                        node = %ctx.nodes[i].name,
                        "required node lacks available resources"
                    );
                    return Err(SelectError::RequiredNodeNoResources {
                        job_id,
                        node: ctx.nodes[i].name.clone(),
                    });
                }
                if ctx.max_nodes == 0 {
                    debug!(job = job_id, "required nodes exceed maximum node limit");
                    return Err(SelectError::ExhaustedBudget { job_id });
                }
                select_cores(ctx, i, rem.min_rem_nodes);
                cpus_to_use(ctx, i, rem.rem_max_cpus, rem.min_rem_nodes);
                if gres_per_job {
                    gres_add(ctx, i);
                }
                if ctx.avail_cpus == 0 {
                    debug!(
                        job = job_id,
                        node = %ctx.nodes[i].name,
                        "required node lacks available resources"
                    );
                    return Err(SelectError::RequiredNodeNoResources {
                        job_id,
                        node: ctx.nodes[i].name.clone(),
                    });
                }
                total_cpus += ctx.avail_cpus as i64;
                rem.charge(ctx.avail_cpus);
                // leaving the bit set, decrement the budget
                ctx.max_nodes -= 1;
            }
        }
        if rem.rem_nodes <= 0 && rem.rem_cpus <= 0 && gres_test(ctx.job) {
            // Required nodes completely satisfied the request
            ctx.node_map.and_assign(req_map);
            done = true;
            return Ok(Prep {
                rem,
                gres_per_job,
                total_cpus,
                span,
                tiers: Vec::new(),
                done,
            });
        }
        if ctx.max_nodes == 0 {
            return Err(SelectError::ExhaustedBudget { job_id });
        }
        orig_node_map.and_not_assign(ctx.node_map);
    } else {
        ctx.node_map.clear_all();
    }

    // CPUs already committed to required nodes stay under the job ceiling
    if let Some(max_cpus) = ctx.job.details.max_cpus {
        if total_cpus > max_cpus as i64 {
            debug!(job = job_id, "can't use required nodes due to max CPU limit");
            return Err(SelectError::MaxCpusExceeded { job_id });
        }
    }

    let tiers = build_weight_tiers(ctx.nodes, &orig_node_map);
    log_weight_tiers(&tiers);

    Ok(Prep {
        rem,
        gres_per_job,
        total_cpus,
        span,
        tiers,
        done,
    })
}

/// Common epilogue: success if the minimum demand is covered; otherwise the
/// caller clears the map and reports the failure.
fn finish(ctx: &EvalContext<'_>, rem: &Remainders, success: bool) -> Result<(), SelectError> {
    if success {
        return Ok(());
    }
    if rem.rem_cpus > 0 || rem.min_rem_nodes > 0 || !gres_test(ctx.job) {
        return Err(SelectError::InsufficientPool {
            job_id: ctx.job.job_id,
        });
    }
    Ok(())
}

/// Spec'd admission step for one candidate; returns the CPUs taken, or
/// `None` when the node cannot contribute.
fn probe_and_admit(
    ctx: &mut EvalContext<'_>,
    i: usize,
    rem: &mut Remainders,
    gres_per_job: bool,
) -> Option<u16> {
    select_cores(ctx, i, rem.min_rem_nodes);
    if ctx.avail_cpus == 0 {
        return None;
    }
    cpus_to_use(ctx, i, rem.rem_max_cpus, rem.min_rem_nodes);
    if gres_per_job {
        gres_add(ctx, i);
    }
    if ctx.avail_cpus == 0 {
        // Clamped down to nothing: the node cannot host a task
        return None;
    }
    let taken = ctx.avail_cpus;
    rem.charge(taken);
    ctx.max_nodes -= 1;
    ctx.node_map.set(i);
    Some(taken)
}

// ── busy ──────────────────────────────────────────────────────────────────────

/// Prefer nodes that already run jobs, leaving idle nodes free for longer
/// running work.
pub(crate) fn eval_busy(ctx: &mut EvalContext<'_>) -> Result<(), SelectError> {
    let rc = busy_inner(ctx);
    if rc.is_err() {
        ctx.node_map.clear_all();
    }
    rc
}

fn busy_inner(ctx: &mut EvalContext<'_>) -> Result<(), SelectError> {
    let mut prep = prepare(ctx)?;
    if prep.done {
        return Ok(());
    }
    let mut success = false;
    let mut all_done = ctx.max_nodes == 0;

    if let Some((i_start, i_end)) = prep.span {
        'tiers: for tier in &prep.tiers {
            if all_done {
                break;
            }
            for idle_pass in 0..2 {
                for i in i_start..=i_end {
                    if ctx.avail_res[i].avail_cpus == 0 {
                        continue;
                    }
                    // Node not available or already selected
                    if !tier.node_map.test(i) || ctx.node_map.test(i) {
                        continue;
                    }
                    let node_idle = ctx.idle_node_map.is_none_or(|m| m.test(i));
                    if (idle_pass == 0 && node_idle) || (idle_pass == 1 && !node_idle) {
                        continue;
                    }
                    let Some(taken) = probe_and_admit(ctx, i, &mut prep.rem, prep.gres_per_job)
                    else {
                        continue;
                    };
                    prep.total_cpus += taken as i64;
                    if prep.rem.satisfied(ctx.job) {
                        success = true;
                        all_done = true;
                        break;
                    }
                    if ctx.max_nodes == 0 {
                        all_done = true;
                        break;
                    }
                }
                if all_done {
                    continue 'tiers;
                }
            }
        }
    }

    finish(ctx, &prep.rem, success)
}

// ── lln ───────────────────────────────────────────────────────────────────────

/// Least-loaded node first: within each weight tier, repeatedly take the
/// node with the greatest available-to-total CPU ratio.
pub(crate) fn eval_lln(ctx: &mut EvalContext<'_>) -> Result<(), SelectError> {
    let rc = lln_inner(ctx);
    if rc.is_err() {
        ctx.node_map.clear_all();
    }
    rc
}

fn lln_inner(ctx: &mut EvalContext<'_>) -> Result<(), SelectError> {
    let mut prep = prepare(ctx)?;
    if prep.done {
        return Ok(());
    }
    let mut success = false;
    let mut all_done = ctx.max_nodes == 0;

    if let Some((i_start, i_end)) = prep.span {
        for tier in &prep.tiers {
            if all_done {
                break;
            }
            loop {
                let mut best_inx: Option<usize> = None;
                let mut best_avail_cpus: u16 = 0;
                for i in i_start..=i_end {
                    // Node not available or already selected
                    if !tier.node_map.test(i) || ctx.node_map.test(i) {
                        continue;
                    }
                    select_cores(ctx, i, prep.rem.min_rem_nodes);
                    cpus_to_use(ctx, i, prep.rem.rem_max_cpus, prep.rem.min_rem_nodes);
                    if ctx.avail_cpus == 0 {
                        continue;
                    }
                    // Greatest ratio of available to total CPUs; the divisors
                    // are shifted around to stay in integer math.
                    let better = match best_inx {
                        None => true,
                        Some(best) => {
                            (ctx.avail_res[best].max_cpus as u64 * ctx.nodes[i].cpus as u64)
                                < (ctx.avail_res[i].max_cpus as u64
                                    * ctx.nodes[best].cpus as u64)
                        }
                    };
                    if better {
                        best_inx = Some(i);
                        best_avail_cpus = ctx.avail_cpus;
                    }
                }
                let Some(i) = best_inx else {
                    // No more usable nodes left, move to the next weight
                    break;
                };
                if best_avail_cpus == 0 {
                    break;
                }
                ctx.avail_cpus = best_avail_cpus;
                if prep.gres_per_job {
                    gres_add(ctx, i);
                }
                prep.total_cpus += ctx.avail_cpus as i64;
                prep.rem.charge(ctx.avail_cpus);
                ctx.max_nodes -= 1;
                ctx.node_map.set(i);
                if prep.rem.satisfied(ctx.job) {
                    success = true;
                    all_done = true;
                    break;
                }
                if ctx.max_nodes == 0 {
                    all_done = true;
                    break;
                }
            }
        }
    }

    finish(ctx, &prep.rem, success)
}

// ── serial ────────────────────────────────────────────────────────────────────

/// Pack serial jobs at the high end of the index range to reduce
/// fragmentation.
pub(crate) fn eval_serial(ctx: &mut EvalContext<'_>) -> Result<(), SelectError> {
    let rc = serial_inner(ctx);
    if rc.is_err() {
        ctx.node_map.clear_all();
    }
    rc
}

fn serial_inner(ctx: &mut EvalContext<'_>) -> Result<(), SelectError> {
    let mut prep = prepare(ctx)?;
    if prep.done {
        return Ok(());
    }
    let mut success = false;
    let mut all_done = ctx.max_nodes == 0;

    if let Some((i_start, i_end)) = prep.span {
        for tier in &prep.tiers {
            if all_done {
                break;
            }
            for i in (i_start..=i_end).rev() {
                if ctx.max_nodes == 0 {
                    all_done = true;
                    break;
                }
                if ctx.avail_res[i].avail_cpus == 0 {
                    continue;
                }
                if !tier.node_map.test(i) || ctx.node_map.test(i) {
                    continue;
                }
                let Some(taken) = probe_and_admit(ctx, i, &mut prep.rem, prep.gres_per_job)
                else {
                    continue;
                };
                prep.total_cpus += taken as i64;
                if prep.rem.satisfied(ctx.job) {
                    success = true;
                    all_done = true;
                    break;
                }
            }
        }
    }

    finish(ctx, &prep.rem, success)
}

// ── spread ────────────────────────────────────────────────────────────────────

/// Use as many nodes as possible: admit every usable candidate, weight tiers
/// ascending, indexes ascending, until the node budget runs out.
pub(crate) fn eval_spread(ctx: &mut EvalContext<'_>) -> Result<(), SelectError> {
    let rc = spread_inner(ctx);
    if rc.is_err() {
        ctx.node_map.clear_all();
    }
    rc
}

fn spread_inner(ctx: &mut EvalContext<'_>) -> Result<(), SelectError> {
    let mut prep = prepare(ctx)?;
    if prep.done {
        return Ok(());
    }
    let mut all_done = ctx.max_nodes == 0;

    if let Some((i_start, i_end)) = prep.span {
        for tier in &prep.tiers {
            if all_done {
                break;
            }
            for i in i_start..=i_end {
                if ctx.avail_res[i].avail_cpus == 0 {
                    continue;
                }
                if !tier.node_map.test(i) || ctx.node_map.test(i) {
                    continue;
                }
                let Some(taken) = probe_and_admit(ctx, i, &mut prep.rem, prep.gres_per_job)
                else {
                    continue;
                };
                prep.total_cpus += taken as i64;
                trace!(node = %ctx.nodes[i].name, cpus = taken, "spread admitted");
                if ctx.max_nodes == 0 {
                    all_done = true;
                    break;
                }
            }
        }
    }

    // No early sufficiency exit above: the whole point is node count
    finish(ctx, &prep.rem, false)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::super::test_support::Fixture;
    use super::super::SelectError;
    use crate::bitmap::NodeSet;
    use crate::config::EvalConfig;
    use assert_matches::assert_matches;

    fn serial_config() -> EvalConfig {
        EvalConfig {
            pack_serial_at_end: true,
            ..Default::default()
        }
    }

    // ── serial ────────────────────────────────────────────────────────────────

    #[test]
    fn serial_job_lands_on_highest_index() {
        let mut fx = Fixture::uniform(10, 1);
        fx.job.details.min_cpus = 1;
        fx.evaluate(serial_config()).unwrap();
        assert_eq!(fx.selected(), vec![9]);
    }

    #[test]
    fn serial_prefers_lower_weight_over_higher_index() {
        let mut fx = Fixture::with_weights(1, &[2, 2, 1, 2, 2]);
        fx.job.details.min_cpus = 1;
        fx.evaluate(serial_config()).unwrap();
        assert_eq!(fx.selected(), vec![2]);
    }

    // ── spread ────────────────────────────────────────────────────────────────

    #[test]
    fn spread_uses_every_usable_node() {
        let mut fx = Fixture::uniform(6, 2);
        fx.job.spread_job = true;
        fx.job.details.min_cpus = 12;
        fx.evaluate_default().unwrap();
        assert_eq!(fx.selected(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn spread_is_capped_by_num_tasks() {
        let mut fx = Fixture::uniform(6, 2);
        fx.job.spread_job = true;
        fx.job.details.min_cpus = 6;
        fx.job.details.num_tasks = Some(3);
        fx.evaluate_default().unwrap();
        assert_eq!(fx.selected(), vec![0, 1, 2]);
    }

    #[test]
    fn spread_skips_nodes_that_cannot_host_a_task() {
        let mut fx = Fixture::uniform(4, 2);
        fx.job.spread_job = true;
        fx.job.details.min_cpus = 6;
        fx.avail_res[1].avail_cpus = 0;
        fx.evaluate_default().unwrap();
        assert_eq!(fx.selected(), vec![0, 2, 3]);
    }

    // ── busy ──────────────────────────────────────────────────────────────────

    #[test]
    fn busy_nodes_admitted_before_idle_ones() {
        let mut fx = Fixture::uniform(4, 4);
        // Nodes 2 and 3 are idle; 0 and 1 are running jobs.
        fx.idle_node_map = Some(NodeSet::from_indices(4, &[2, 3]));
        fx.prefer_alloc_nodes = true;
        fx.min_nodes = 2;
        fx.req_nodes = 2;
        fx.job.details.min_cpus = 8;
        fx.evaluate_default().unwrap();
        assert_eq!(fx.selected(), vec![0, 1]);
    }

    #[test]
    fn busy_falls_back_to_idle_nodes() {
        let mut fx = Fixture::uniform(4, 4);
        fx.idle_node_map = Some(NodeSet::from_indices(4, &[2, 3]));
        fx.prefer_alloc_nodes = true;
        fx.min_nodes = 3;
        fx.req_nodes = 3;
        fx.job.details.min_cpus = 12;
        fx.evaluate_default().unwrap();
        assert_eq!(fx.selected(), vec![0, 1, 2]);
    }

    #[test]
    fn busy_admits_required_nodes_first() {
        let mut fx = Fixture::uniform(4, 4);
        fx.idle_node_map = Some(NodeSet::from_indices(4, &[0, 1, 2, 3]));
        fx.prefer_alloc_nodes = true;
        fx.min_nodes = 2;
        fx.req_nodes = 2;
        fx.job.details.min_cpus = 4;
        fx.job.details.req_node_bitmap = Some(NodeSet::from_indices(4, &[3]));
        fx.evaluate_default().unwrap();
        let selected = fx.selected();
        assert!(selected.contains(&3), "required node must be selected");
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn busy_failure_clears_the_map() {
        let mut fx = Fixture::uniform(3, 2);
        fx.prefer_alloc_nodes = true;
        fx.job.details.req_node_bitmap = Some(NodeSet::from_indices(3, &[0]));
        fx.job.details.min_cpus = 100;
        let err = fx.evaluate_default().unwrap_err();
        assert_matches!(err, SelectError::InsufficientPool { .. });
        assert_eq!(fx.selected(), Vec::<usize>::new());
    }

    // ── lln ───────────────────────────────────────────────────────────────────

    #[test]
    fn lln_picks_highest_available_ratio_first() {
        // A: 4 of 8 available (ratio 1/2); B: 3 of 4 available (ratio 3/4).
        // Cross-product compare: 3·8 > 4·4, so B goes first.
        let mut fx = Fixture::uniform(2, 8);
        fx.nodes[1].cpus = 4;
        fx.avail_res[0].avail_cpus = 4;
        fx.avail_res[0].max_cpus = 4;
        fx.avail_res[1].avail_cpus = 3;
        fx.avail_res[1].max_cpus = 3;
        fx.cr_type.lln = true;
        fx.job.details.min_cpus = 1;
        fx.evaluate_default().unwrap();
        assert_eq!(fx.selected(), vec![1]);
    }

    #[test]
    fn lln_ratio_order_is_respected_across_a_tier() {
        // Ratios: node0 1/8, node1 8/8, node2 4/8 — admission order 1, 2, 0.
        let mut fx = Fixture::uniform(3, 8);
        fx.avail_res[0].avail_cpus = 1;
        fx.avail_res[0].max_cpus = 1;
        fx.avail_res[1].avail_cpus = 8;
        fx.avail_res[1].max_cpus = 8;
        fx.avail_res[2].avail_cpus = 4;
        fx.avail_res[2].max_cpus = 4;
        fx.cr_type.lln = true;
        fx.min_nodes = 2;
        fx.req_nodes = 2;
        fx.job.details.min_cpus = 12;
        fx.evaluate_default().unwrap();
        assert_eq!(fx.selected(), vec![1, 2]);
    }

    #[test]
    fn lln_failure_clears_the_map() {
        let mut fx = Fixture::uniform(2, 2);
        fx.cr_type.lln = true;
        fx.job.details.min_cpus = 50;
        let err = fx.evaluate_default().unwrap_err();
        assert_matches!(err, SelectError::InsufficientPool { .. });
        assert_eq!(fx.selected(), Vec::<usize>::new());
    }

    // ── Shared skeleton ───────────────────────────────────────────────────────

    #[test]
    fn required_node_without_resources_fails() {
        let mut fx = Fixture::uniform(3, 4);
        fx.job.spread_job = true;
        fx.job.details.req_node_bitmap = Some(NodeSet::from_indices(3, &[1]));
        fx.avail_res[1].avail_cpus = 0;
        let err = fx.evaluate_default().unwrap_err();
        assert_matches!(err, SelectError::RequiredNodeNoResources { .. });
        assert_eq!(fx.selected(), Vec::<usize>::new());
    }

    #[test]
    fn required_nodes_alone_can_satisfy_the_request() {
        let mut fx = Fixture::uniform(4, 4);
        fx.job.spread_job = true;
        fx.job.details.req_node_bitmap = Some(NodeSet::from_indices(4, &[1, 2]));
        fx.job.details.min_cpus = 8;
        fx.min_nodes = 2;
        fx.req_nodes = 2;
        fx.evaluate_default().unwrap();
        assert_eq!(fx.selected(), vec![1, 2]);
    }

    #[test]
    fn required_cpu_total_over_job_ceiling_fails() {
        let mut fx = Fixture::uniform(3, 8);
        fx.job.spread_job = true;
        fx.job.details.req_node_bitmap = Some(NodeSet::from_indices(3, &[0, 1]));
        // The required nodes commit 16 CPUs, over the 10-CPU ceiling, while
        // still leaving demand open (min_cpus 20).  The pn_min_cpus floor
        // keeps the per-node clamp from hiding the overshoot.
        fx.job.details.min_cpus = 20;
        fx.job.details.max_cpus = Some(10);
        fx.job.details.pn_min_cpus = 8;
        fx.min_nodes = 2;
        fx.req_nodes = 2;
        let err = fx.evaluate_default().unwrap_err();
        assert_matches!(err, SelectError::MaxCpusExceeded { .. });
    }
}
