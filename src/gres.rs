/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Job-level generic resource (GRES) accounting.
//!
//! A job may demand generic resources (GPUs, NICs, …) at the job level; the
//! selection strategies must then keep admitting nodes until the committed
//! GRES covers the demand, and per-node CPU counts may be tightened by the
//! GRES-to-socket binding.  The accounting protocol:
//!
//! * [`GresJobReq::sched_init`] — reset commitments at the start of an
//!   evaluation; returns whether the job is GRES-constrained at all.
//! * [`GresJobReq::sched_add`] — commit a node's availability on admission,
//!   possibly tightening the node's usable CPU count.
//! * [`GresJobReq::sched_test`] — is the job-level demand met by the
//!   commitments so far?
//! * [`GresJobReq::accumulate`] / [`GresJobReq::sufficient`] — run-local
//!   what-if bucket: would committing this set of nodes satisfy the demand?
//!
//! [`SockGres`] is the per-node view handed over by the external core picker:
//! available counts per GRES name plus the binding hints (`min_cores`,
//! `max_tasks`, `cpu_limit`) that the socket/core filter applies during core
//! selection.

use std::collections::BTreeMap;

// ── Per-node availability ─────────────────────────────────────────────────────

/// GRES counts keyed by resource name.  `BTreeMap` keeps iteration (and
/// therefore commitment order) deterministic.
pub type GresAvail = BTreeMap<String, u64>;

/// Per-node GRES availability and binding hints.
#[derive(Debug, Clone, Default)]
pub struct SockGres {
    /// Available count per GRES name on this node.
    pub avail: GresAvail,

    /// CPU ceiling imposed by the GRES selection on this node, if any.
    pub cpu_limit: Option<u16>,

    /// Minimum cores per node implied by GRES core binding.
    pub min_cores: u16,

    /// Task ceiling implied by the GRES availability, if any.
    pub max_tasks: Option<u32>,
}

impl SockGres {
    /// Availability of one GRES name (0 when absent).
    pub fn avail_of(&self, name: &str) -> u64 {
        self.avail.get(name).copied().unwrap_or(0)
    }
}

// ── Job-level demand ──────────────────────────────────────────────────────────

/// Job-level GRES demand plus the running commitment state.
#[derive(Debug, Clone, Default)]
pub struct GresJobReq {
    demands: GresAvail,
    allocated: GresAvail,
}

impl GresJobReq {
    /// A demand of `count` units of each named resource.
    pub fn new<I, S>(demands: I) -> Self
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<String>,
    {
        Self {
            demands: demands.into_iter().map(|(n, c)| (n.into(), c)).collect(),
            allocated: GresAvail::new(),
        }
    }

    /// Reset the commitment state for a fresh evaluation.
    ///
    /// Returns `true` iff the job carries any job-level GRES demand.
    pub fn sched_init(&mut self) -> bool {
        self.allocated.clear();
        self.demands.values().any(|&c| c > 0)
    }

    /// Units of `name` still uncommitted.
    fn remaining(&self, name: &str) -> u64 {
        let demand = self.demands.get(name).copied().unwrap_or(0);
        let alloc = self.allocated.get(name).copied().unwrap_or(0);
        demand.saturating_sub(alloc)
    }

    /// Commit an admitted node's availability against the demand.
    ///
    /// Takes as much of each demanded resource as the node offers; when
    /// anything was taken, the node's GRES CPU ceiling (if present) tightens
    /// `avail_cpus`.
    pub fn sched_add(&mut self, sock: &SockGres, avail_cpus: &mut u16) {
        let mut took_any = false;
        let names: Vec<String> = self.demands.keys().cloned().collect();
        for name in names {
            let take = self.remaining(&name).min(sock.avail_of(&name));
            if take > 0 {
                *self.allocated.entry(name).or_insert(0) += take;
                took_any = true;
            }
        }
        if took_any {
            if let Some(limit) = sock.cpu_limit {
                *avail_cpus = (*avail_cpus).min(limit);
            }
        }
    }

    /// `true` iff every demand is covered by the commitments so far.
    pub fn sched_test(&self) -> bool {
        self.demands.iter().all(|(name, &demand)| {
            self.allocated.get(name).copied().unwrap_or(0) >= demand
        })
    }

    /// Fold a node's availability into a run-local what-if bucket.
    pub fn accumulate(&self, bucket: &mut Option<GresAvail>, sock: &SockGres) {
        let bucket = bucket.get_or_insert_with(GresAvail::new);
        for name in self.demands.keys() {
            let avail = sock.avail_of(name);
            if avail > 0 {
                *bucket.entry(name.clone()).or_insert(0) += avail;
            }
        }
    }

    /// Would committing `extra` on top of the current commitments satisfy the
    /// demand?
    pub fn sufficient(&self, extra: Option<&GresAvail>) -> bool {
        self.demands.iter().all(|(name, &demand)| {
            let alloc = self.allocated.get(name).copied().unwrap_or(0);
            let add = extra.and_then(|e| e.get(name)).copied().unwrap_or(0);
            alloc + add >= demand
        })
    }
}

// ── Socket/core filter ────────────────────────────────────────────────────────

/// Joint socket/core GRES filter, applied during per-node core selection for
/// GRES-constrained jobs.
///
/// Tightens the task range and CPU count to what the node's GRES binding
/// supports.  With `enforce_binding` set, a node offering none of the
/// demanded resources cannot host any task.
pub fn filter_sock_core(
    req: &GresJobReq,
    sock: Option<&SockGres>,
    enforce_binding: bool,
    avail_cpus: &mut u16,
    max_tasks: &mut u32,
    min_cores: &mut u32,
) {
    let Some(sock) = sock else {
        if enforce_binding {
            *max_tasks = 0;
        }
        return;
    };

    if enforce_binding && req.demands.keys().all(|name| sock.avail_of(name) == 0) {
        *max_tasks = 0;
        return;
    }

    if let Some(cap) = sock.max_tasks {
        *max_tasks = (*max_tasks).min(cap);
    }
    *min_cores = (*min_cores).max(sock.min_cores as u32);
    if let Some(limit) = sock.cpu_limit {
        *avail_cpus = (*avail_cpus).min(limit);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
