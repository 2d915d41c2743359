/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Structured error type for node selection.
//!
//! Every evaluation reports exactly two outcomes — success or failure — but
//! each failure carries a typed variant naming what went wrong, so the
//! diagnostic the scheduler logs is unambiguous.  Callers that only care
//! about success/failure treat every variant uniformly.

use thiserror::Error;

/// Why an evaluation failed to produce a selection.
///
/// | Variant | Raised when |
/// |---|---|
/// | `EmptyCandidates` | candidate pool smaller than `min_nodes` |
/// | `RequiredUnavailable` | required nodes missing from the pool / any region |
/// | `RequiredNodeNoResources` | a required node cannot contribute CPUs |
/// | `RequiredExcess` | more required nodes than `max_nodes` |
/// | `TopologySplit` | required set spans more than one top switch / block |
/// | `TopSwitchUnknown` | no top-level switch covers the request |
/// | `NoUsableBlock` | no block covers the request |
/// | `InsufficientPool` | weight-tier accumulation cannot reach the demand |
/// | `ExhaustedBudget` | `max_nodes` hit before sufficiency |
/// | `MaxCpusExceeded` | required nodes alone exceed the job CPU ceiling |
#[derive(Debug, Error)]
pub enum SelectError {
    /// The candidate pool cannot possibly hold the job.
    #[error("job {job_id} has {avail} candidate nodes, fewer than the {min_nodes} required")]
    EmptyCandidates {
        job_id: u32,
        avail: u32,
        min_nodes: u32,
    },

    /// The required node set is not contained in the candidate pool (or, for
    /// the block strategy, not contained in any block).
    #[error("job {job_id} requires nodes which are not currently available")]
    RequiredUnavailable { job_id: u32 },

    /// A required node passed filtering with zero usable CPUs.
    #[error("job {job_id} required node {node} lacks available resources")]
    RequiredNodeNoResources { job_id: u32, node: String },

    /// More required nodes than the job may allocate.
    #[error("job {job_id} requires more nodes than currently available ({required} > {max_nodes})")]
    RequiredExcess {
        job_id: u32,
        required: u32,
        max_nodes: u32,
    },

    /// The required nodes do not share one topology region.
    #[error("job {job_id} requires nodes that do not share a common {region}")]
    TopologySplit {
        job_id: u32,
        region: &'static str,
    },

    /// No top-level switch spans the request (disjoint topology).
    #[error("job {job_id} unable to identify a top-level switch")]
    TopSwitchUnknown { job_id: u32 },

    /// No block can hold the request.
    #[error("job {job_id} unable to find a block for the request")]
    NoUsableBlock { job_id: u32 },

    /// The accumulated best tiers cannot reach the CPU / node / GRES demand.
    #[error("insufficient resources currently available for job {job_id}")]
    InsufficientPool { job_id: u32 },

    /// The node budget ran out before the demand was satisfied.
    #[error("job {job_id} reached its maximum node limit")]
    ExhaustedBudget { job_id: u32 },

    /// Required nodes alone exceed the job's maximum CPU count.
    #[error("job {job_id} can't use required nodes due to max CPU limit")]
    MaxCpusExceeded { job_id: u32 },
}
