//! Shared fixtures for the selection strategy tests.

use crate::bitmap::{CoreSet, NodeSet};
use crate::config::{EvalConfig, SelectTypeFlags};
use crate::job::{JobRecord, McInfo};
use crate::node::{AvailRes, NodeRecord};
use crate::topology::{BlockLayout, BlockRecord, SwitchRecord, Topology};

use super::{EvalContext, Evaluator, SelectError};

/// Owns every piece an [`EvalContext`] borrows, so tests can build a cluster,
/// tweak it, run an evaluation and inspect the outcome.
pub(crate) struct Fixture {
    pub nodes: Vec<NodeRecord>,
    pub topology: Topology,
    pub job: JobRecord,
    pub node_map: NodeSet,
    pub avail_res: Vec<AvailRes>,
    pub avail_core: Vec<CoreSet>,
    pub idle_node_map: Option<NodeSet>,
    pub min_nodes: u32,
    pub req_nodes: u32,
    pub max_nodes: u32,
    pub prefer_alloc_nodes: bool,
    pub enforce_binding: bool,
    pub cr_type: SelectTypeFlags,
    pub mc: McInfo,
    pub time_now: i64,
}

impl Fixture {
    /// `n` identical nodes of weight 1 with `cpus` CPUs each, all candidates,
    /// flat topology, job asking for 1 CPU on 1 node.
    pub fn uniform(n: usize, cpus: u16) -> Self {
        let nodes = (0..n)
            .map(|i| NodeRecord {
                name: format!("node{i:02}"),
                sched_weight: 1,
                cpus,
                boards: 1,
                tot_sockets: 1,
                cores: cpus,
                tot_cores: cpus,
                tpc: 1,
                core_spec_cnt: 0,
            })
            .collect::<Vec<_>>();

        let mut node_map = NodeSet::new(n);
        for i in 0..n {
            node_map.set(i);
        }

        let mut job = JobRecord::default();
        job.job_id = 1234;
        job.details.min_cpus = 1;
        job.details.min_nodes = 1;
        job.details.max_nodes = n as u32;

        Self {
            avail_res: (0..n).map(|_| AvailRes::with_cpus(cpus)).collect(),
            avail_core: (0..n)
                .map(|_| {
                    let mut cores = CoreSet::new(cpus as usize);
                    for c in 0..cpus as usize {
                        cores.set(c);
                    }
                    cores
                })
                .collect(),
            nodes,
            topology: Topology::flat(),
            job,
            node_map,
            idle_node_map: None,
            min_nodes: 1,
            req_nodes: 1,
            max_nodes: n as u32,
            prefer_alloc_nodes: false,
            enforce_binding: false,
            cr_type: SelectTypeFlags::default(),
            mc: McInfo::default(),
            time_now: 1_000,
        }
    }

    /// Like [`uniform`](Self::uniform) but with explicit per-node weights.
    pub fn with_weights(cpus: u16, weights: &[u64]) -> Self {
        let mut fx = Self::uniform(weights.len(), cpus);
        for (node, &w) in fx.nodes.iter_mut().zip(weights) {
            node.sched_weight = w;
        }
        fx
    }

    /// Install a two-level switch tree: one leaf per entry of `leaves`, all
    /// under a single root.  Leaf-to-leaf distance is 2 hops, leaf-to-root 1.
    pub fn set_tree_topology(&mut self, leaves: &[&[usize]]) {
        let n = self.nodes.len();
        let switch_cnt = leaves.len() + 1;
        let root_inx = leaves.len();

        let dist_from = |from: usize| -> Vec<u32> {
            (0..switch_cnt)
                .map(|to| {
                    if from == to {
                        0
                    } else if from == root_inx || to == root_inx {
                        1
                    } else {
                        2
                    }
                })
                .collect()
        };

        let mut switches: Vec<SwitchRecord> = leaves
            .iter()
            .enumerate()
            .map(|(i, members)| SwitchRecord {
                name: format!("leaf{i}"),
                level: 0,
                parent: root_inx,
                node_bitmap: NodeSet::from_indices(n, members),
                switches_dist: dist_from(i),
                link_speed: 100,
            })
            .collect();

        let mut root_map = NodeSet::new(n);
        for members in leaves {
            for &i in *members {
                root_map.set(i);
            }
        }
        switches.push(SwitchRecord {
            name: "root".into(),
            level: 1,
            parent: root_inx,
            node_bitmap: root_map,
            switches_dist: dist_from(root_inx),
            link_speed: 100,
        });

        self.topology.switches = switches;
    }

    /// Partition the node table into base-blocks of `bblock_node_cnt` nodes
    /// and install a block layout with the given grouping exponents.
    pub fn set_block_topology(&mut self, bblock_node_cnt: usize, block_levels: u16) {
        let n = self.nodes.len();
        let mut records = Vec::new();
        let mut union = NodeSet::new(n);
        let mut start = 0;
        while start < n {
            let end = (start + bblock_node_cnt).min(n);
            let members: Vec<usize> = (start..end).collect();
            for &i in &members {
                union.set(i);
            }
            records.push(BlockRecord {
                name: format!("bb{}", records.len()),
                node_bitmap: NodeSet::from_indices(n, &members),
            });
            start = end;
        }
        self.topology.blocks = Some(BlockLayout {
            records,
            block_levels,
            bblock_node_cnt: bblock_node_cnt as u32,
            nodes_bitmap: union,
        });
    }

    /// Borrow everything into an evaluation context.
    pub fn ctx(&mut self) -> EvalContext<'_> {
        EvalContext {
            nodes: &self.nodes,
            topology: &self.topology,
            job: &mut self.job,
            node_map: &mut self.node_map,
            avail_res: &mut self.avail_res,
            avail_core: &mut self.avail_core,
            idle_node_map: self.idle_node_map.as_ref(),
            min_nodes: self.min_nodes,
            req_nodes: self.req_nodes,
            max_nodes: self.max_nodes,
            prefer_alloc_nodes: self.prefer_alloc_nodes,
            enforce_binding: self.enforce_binding,
            cr_type: self.cr_type,
            mc: self.mc,
            time_now: self.time_now,
            avail_cpus: 0,
        }
    }

    /// Run a full evaluation under `cfg`.
    pub fn evaluate(&mut self, cfg: EvalConfig) -> Result<(), SelectError> {
        let evaluator = Evaluator::new(cfg);
        let mut ctx = self.ctx();
        evaluator.evaluate(&mut ctx)
    }

    /// Run a full evaluation under the default configuration.
    pub fn evaluate_default(&mut self) -> Result<(), SelectError> {
        self.evaluate(EvalConfig::default())
    }

    /// The selected node indexes, ascending.
    pub fn selected(&self) -> Vec<usize> {
        self.node_map.ones().collect()
    }
}
