/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Consecutive-run strategy: the no-topology default.
//!
//! Candidates are partitioned into *runs* — maximal stretches of consecutive
//! node indexes sharing one scheduling weight (weight is ignored for
//! contiguous jobs).  Runs are then consumed best-first:
//!
//! 1. a run containing required nodes beats one that does not;
//! 2. lower weight beats higher;
//! 3. at equal weight, a run already large enough beats one that is not;
//!    among sufficient runs the tightest fit wins, among insufficient runs
//!    the largest;
//! 4. for contiguous jobs, the first run large enough wins.
//!
//! A run with required nodes is filled outward from its first required index;
//! otherwise, when at most one node is still needed, the tightest-fitting
//! single node takes the whole remaining request and the rest of the run is
//! zeroed out.

use std::mem;

use tracing::{debug, trace};

use super::{
    cpus_to_use, enough_nodes, gres_accumulate, gres_add, gres_init, gres_sufficient,
    gres_sufficient_node, gres_test, reduce_to_required, select_cores, EvalContext, Remainders,
    SelectError,
};
use crate::bitmap::NodeSet;
use crate::gres::GresAvail;

/// One set of consecutive candidate indexes of equal weight.
#[derive(Debug, Default)]
struct Run {
    /// CPUs this run can contribute.
    cpus: i64,
    /// Selectable (non-required) nodes in the run.
    nodes: i64,
    start: usize,
    end: usize,
    /// First required index inside the run, if any.
    req: Option<usize>,
    /// Scheduling weight of the run's nodes; `None` until a node is added.
    weight: Option<u64>,
    /// GRES the run can contribute.
    gres: Option<GresAvail>,
}

pub(crate) fn eval(ctx: &mut EvalContext<'_>) -> Result<(), SelectError> {
    let req_map = ctx.job.details.req_node_bitmap.clone();
    let rc = consec_inner(ctx, req_map.as_ref());
    if rc.is_err() {
        reduce_to_required(ctx.node_map, req_map.as_ref());
    }
    rc
}

fn consec_inner(
    ctx: &mut EvalContext<'_>,
    req_map: Option<&NodeSet>,
) -> Result<(), SelectError> {
    let job_id = ctx.job.job_id;
    let node_cnt = ctx.nodes.len();
    let contiguous = ctx.job.details.contiguous;
    ctx.avail_cpus = 0;

    let gres_per_job = gres_init(ctx.job);
    let mut rem = Remainders::new(
        &ctx.job.details,
        ctx.min_nodes,
        ctx.req_nodes,
        gres_per_job,
    );
    let mut avail_cpu_per_node = vec![0u16; node_cnt];
    let mut total_cpus: i64 = 0;

    // Required nodes first: take their resources, then fill from the runs
    if let Some(req_map) = req_map {
        let arbitrary_tpn = ctx.job.details.arbitrary_tpn.clone();
        let mut req_inx = 0usize;
        for i in req_map.ones().collect::<Vec<_>>() {
            if ctx.max_nodes == 0 {
                break;
            }
            select_cores(ctx, i, rem.min_rem_nodes);
            if let Some(tpn) = &arbitrary_tpn {
                let mut req_cpus =
                    tpn.get(req_inx).copied().unwrap_or(0) as i64 * ctx.mc.cpus_per_task as i64;
                req_inx += 1;
                req_cpus = req_cpus.max(ctx.job.details.pn_min_cpus as i64);
                req_cpus = req_cpus.max(ctx.job.details.min_gres_cpu as i64);

                if (ctx.avail_cpus as i64) < req_cpus {
                    debug!(
                        job = job_id,
                        node = %ctx.nodes[i].name,
                        needed = req_cpus,
                        has = ctx.avail_cpus,
                        "required node is short of CPUs for its task count"
                    );
                    return Err(SelectError::RequiredNodeNoResources {
                        job_id,
                        node: ctx.nodes[i].name.clone(),
                    });
                }
                ctx.avail_cpus = req_cpus as u16;
                let ares = &mut ctx.avail_res[i];
                ares.avail_cpus = req_cpus as u16;
                ares.avail_res_cnt = ares.avail_cpus.saturating_add(ares.avail_gpus);
            } else {
                cpus_to_use(ctx, i, rem.rem_max_cpus, rem.min_rem_nodes);
            }
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
            avail_cpu_per_node[i] = ctx.avail_cpus;
            total_cpus += ctx.avail_cpus as i64;
            rem.charge(ctx.avail_cpus);
            ctx.max_nodes -= 1;
        }
        if rem.rem_nodes <= 0 && rem.rem_cpus <= 0 && gres_test(ctx.job) {
            ctx.node_map.and_assign(req_map);
            return Ok(());
        }
        if ctx.max_nodes == 0 {
            return Err(SelectError::ExhaustedBudget { job_id });
        }
    }

    // Build the run table.  Required nodes glue runs together without
    // counting as selectable; unusable nodes end the current run.
    let mut runs: Vec<Run> = Vec::new();
    let mut cur = Run::default();
    for i in 0..node_cnt {
        let required_node = req_map.is_some_and(|r| r.test(i));
        let mut present = ctx.node_map.test(i);
        if present && !required_node {
            select_cores(ctx, i, rem.min_rem_nodes);
            if ctx.avail_cpus == 0 {
                ctx.node_map.clear(i);
                present = false;
            }
            avail_cpu_per_node[i] = ctx.avail_cpus;
        }

        // A contiguous job does not care about matching node weights
        if present
            && !contiguous
            && cur.weight.is_some()
            && cur.weight != Some(ctx.nodes[i].sched_weight)
        {
            if cur.nodes == 0 {
                // Only required nodes so far, re-use the record
                cur.req = None;
            } else {
                cur.end = i - 1;
                runs.push(mem::take(&mut cur));
            }
        }

        if present {
            if cur.nodes == 0 {
                cur.start = i;
            }
            if required_node {
                // Resource counters were updated above; leave the bit set
                if cur.req.is_none() {
                    cur.req = Some(i);
                }
                continue;
            }
            // Not selected (yet)
            ctx.node_map.clear(i);
            cur.cpus += avail_cpu_per_node[i] as i64;
            cur.nodes += 1;
            if gres_per_job {
                gres_accumulate(ctx, i, &mut cur.gres);
            }
            cur.weight = Some(ctx.nodes[i].sched_weight);
        } else if cur.nodes == 0 {
            cur.req = None;
            cur.weight = None;
        } else {
            cur.end = i - 1;
            runs.push(mem::take(&mut cur));
        }
    }
    if cur.nodes != 0 {
        cur.end = node_cnt - 1;
        runs.push(cur);
    }

    for (ri, run) in runs.iter().enumerate() {
        trace!(
            run = ri,
            cpus = run.cpus,
            nodes = run.nodes,
            begin = run.start,
            end = run.end,
            required = ?run.req,
            weight = ?run.weight,
            "consecutive set"
        );
    }

    // CPUs already committed to required nodes stay under the job ceiling
    if let Some(max_cpus) = ctx.job.details.max_cpus {
        if total_cpus > max_cpus as i64 {
            debug!(job = job_id, "can't use required nodes due to max CPU limit");
            return Err(SelectError::MaxCpusExceeded { job_id });
        }
    }

    // Accumulate nodes from the runs until the demand is covered
    let mut success = false;
    while !runs.is_empty() && ctx.max_nodes > 0 {
        let mut best: Option<usize> = None;
        let mut best_sufficient = false;
        let mut best_cpus: i64 = 0;
        let mut best_req: Option<usize> = None;
        let mut best_weight: u64 = 0;
        let mut split_required = false;

        for (ri, run) in runs.iter().enumerate() {
            if run.nodes == 0 {
                continue; // no usable nodes here
            }
            if contiguous && req_map.is_some() && run.req.is_none() {
                continue; // not the required run
            }
            let mut sufficient = run.cpus >= rem.rem_cpus
                && enough_nodes(run.nodes, rem.rem_nodes, ctx.min_nodes, ctx.req_nodes);
            if sufficient && gres_per_job {
                sufficient = gres_sufficient(ctx.job, run.gres.as_ref());
            }

            let run_weight = run.weight.unwrap_or(u64::MAX);
            // First possibility, or contains required nodes, or lowest weight
            let mut new_best = best.is_none()
                || (best_req.is_none() && run.req.is_some())
                || run_weight < best_weight;
            // At equal weight: first set large enough, else tightest fit,
            // else the biggest so far
            if !new_best
                && run_weight == best_weight
                && ((sufficient && !best_sufficient)
                    || (sufficient && run.cpus < best_cpus)
                    || (!sufficient && run.cpus > best_cpus))
            {
                new_best = true;
            }
            // First contiguous run large enough
            if !new_best && !best_sufficient && contiguous && sufficient {
                new_best = true;
            }
            if new_best {
                best = Some(ri);
                best_cpus = run.cpus;
                best_req = run.req;
                best_sufficient = sufficient;
                best_weight = run_weight;
            }

            if contiguous && req_map.is_some() {
                // Wait until all required nodes share one consecutive run
                if runs[ri + 1..].iter().any(|r| r.req.is_some()) {
                    split_required = true;
                    break;
                }
            }
        }
        let Some(best_inx) = best else { break };
        if split_required {
            break;
        }
        if contiguous && !best_sufficient {
            break; // no hole large enough
        }

        let first = runs[best_inx].start;
        let last = runs[best_inx].end;
        if let Some(req_first) = best_req {
            // The run holds required nodes: work up from the first required
            // index, then down from it
            for i in req_first..=last {
                if ctx.max_nodes == 0 || rem.satisfied(ctx.job) {
                    break;
                }
                if ctx.node_map.test(i) {
                    continue; // required node already in the set
                }
                if avail_cpu_per_node[i] == 0 {
                    continue;
                }
                ctx.avail_cpus = avail_cpu_per_node[i];
                cpus_to_use(ctx, i, rem.rem_max_cpus, rem.min_rem_nodes);
                if gres_per_job {
                    gres_add(ctx, i);
                }
                total_cpus += ctx.avail_cpus as i64;
                ctx.node_map.set(i);
                rem.charge(ctx.avail_cpus);
                ctx.max_nodes -= 1;
            }
            for i in (first..req_first).rev() {
                if ctx.max_nodes == 0 || rem.satisfied(ctx.job) {
                    break;
                }
                if ctx.node_map.test(i) {
                    continue;
                }
                if avail_cpu_per_node[i] == 0 {
                    continue;
                }
                ctx.avail_cpus = avail_cpu_per_node[i];
                cpus_to_use(ctx, i, rem.rem_max_cpus, rem.min_rem_nodes);
                if gres_per_job {
                    gres_add(ctx, i);
                }
                total_cpus += ctx.avail_cpus as i64;
                ctx.node_map.set(i);
                rem.charge(ctx.avail_cpus);
                ctx.max_nodes -= 1;
            }
        } else {
            if rem.rem_nodes <= 1 {
                // One node left to pick: take the tightest fit alone and
                // withdraw the rest of the run from consideration
                let mut best_fit: Option<usize> = None;
                let mut best_size: i64 = 0;
                for i in first..=last {
                    if ctx.node_map.test(i) {
                        continue;
                    }
                    if (avail_cpu_per_node[i] as i64) < rem.rem_cpus {
                        continue;
                    }
                    if gres_per_job && !gres_sufficient_node(ctx.job, &ctx.avail_res[i]) {
                        continue;
                    }
                    if best_fit.is_none() || (avail_cpu_per_node[i] as i64) < best_size {
                        best_fit = Some(i);
                        best_size = avail_cpu_per_node[i] as i64;
                        if best_size == rem.rem_cpus {
                            break;
                        }
                    }
                }
                if let Some(best_fit) = best_fit {
                    for i in first..=last {
                        if i != best_fit {
                            avail_cpu_per_node[i] = 0;
                        }
                    }
                }
            }

            for i in first..=last {
                if ctx.max_nodes == 0 || rem.satisfied(ctx.job) {
                    break;
                }
                if ctx.node_map.test(i) {
                    continue;
                }
                ctx.avail_cpus = avail_cpu_per_node[i];
                if ctx.avail_cpus == 0 {
                    continue;
                }
                if ctx.max_nodes == 1 && (ctx.avail_cpus as i64) < rem.rem_cpus {
                    // Only one more node may be added and this one cannot
                    // cover the rest alone
                    continue;
                }
                cpus_to_use(ctx, i, rem.rem_max_cpus, rem.min_rem_nodes);
                if gres_per_job {
                    gres_add(ctx, i);
                }
                total_cpus += ctx.avail_cpus as i64;
                ctx.node_map.set(i);
                rem.charge(ctx.avail_cpus);
                ctx.max_nodes -= 1;
            }
        }

        if rem.rem_nodes <= 0 && rem.rem_cpus <= 0 && gres_test(ctx.job) {
            success = true;
            break;
        }
        runs[best_inx].cpus = 0;
        runs[best_inx].nodes = 0;
    }

    if !success
        && rem.rem_cpus <= 0
        && gres_test(ctx.job)
        && enough_nodes(0, rem.rem_nodes, ctx.min_nodes, ctx.req_nodes)
    {
        success = true;
    }

    if success {
        Ok(())
    } else {
        Err(SelectError::InsufficientPool { job_id })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
