/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! node-select – the node-selection core of the cluster scheduler.
//!
//! Given a candidate node bitmap and a pending job's resource request, the
//! [`select::Evaluator`] narrows the bitmap to a selection that satisfies the
//! request under one of seven placement strategies (block, switch-tree,
//! dragonfly, consecutive, least-loaded, busy-first, spread, serial).  The
//! surrounding scheduler owns the node, job and topology records and holds
//! them exclusively for the duration of one evaluation.
//!
//! Module layout:
//!
//! ```text
//! lib.rs
//! ├── bitmap/    – compact node / core bit sets
//! ├── config/    – frozen process-wide selection toggles
//! ├── node/      – node records and availability bookkeeping
//! ├── job/       – job request snapshot
//! ├── topology/  – switch tree and hierarchical block layouts
//! ├── gres/      – job-level generic resource accounting
//! └── select/    – the evaluator: dispatch, admission protocol, strategies
//! ```

pub mod bitmap;
pub mod config;
pub mod gres;
pub mod job;
pub mod node;
pub mod select;
pub mod topology;

pub use bitmap::{CoreSet, NodeSet};
pub use config::{EvalConfig, SelectTypeFlags};
pub use select::{EvalContext, Evaluator, SelectError};
