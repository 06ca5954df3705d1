//! All-pairs shortest path planning for NetMirage topologies
//!
//! [`RoutePlanner`] holds a dense weight matrix over `n` nodes and computes
//! every shortest path with a cache-blocked Floyd-Warshall. Large matrices are
//! relaxed in parallel on a persistent worker pool. After [`RoutePlanner::plan`]
//! the planner answers path and distance queries until it is dropped.
//!
//! ```
//! use route_planner::RoutePlanner;
//!
//! let mut planner = RoutePlanner::new(3).unwrap();
//! planner.set_weight(0, 1, 10.0).unwrap();
//! planner.set_weight(1, 2, 20.0).unwrap();
//! planner.set_weight(0, 2, 100.0).unwrap();
//! planner.plan();
//!
//! assert_eq!(planner.route(0, 2), Some(&[0, 1, 2][..]));
//! assert_eq!(planner.weight(0, 2), Some(30.0));
//! ```

mod matrix;
mod pool;

pub use matrix::BLOCK_SIZE;
pub use pool::THREAD_WORK_SIZE;

use matrix::{relax_block, round_chunks, Cell, Layout};
use pool::WorkerPool;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

/// Dense node index within a planner
pub type NodeId = u32;

/// Node counts above this value relax chunks on the worker pool by default
pub const DEFAULT_THREAD_THRESHOLD: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlannerError {
    #[error("Route planner cannot hold {0} nodes")]
    TooManyNodes(usize),

    #[error("Failed to allocate route matrix of {0} cells")]
    Allocation(usize),

    #[error("Node {node} is out of range for a planner of {count} nodes")]
    NodeOutOfRange { node: NodeId, count: usize },

    #[error("Invalid weight {weight} for edge {from} -> {to}")]
    InvalidWeight { from: NodeId, to: NodeId, weight: f32 },
}

/// Tuning knobs for parallel planning
#[derive(Debug, Clone)]
pub struct PlannerOptions {
    /// Worker threads used for large matrices; 0 or 1 disables the pool
    pub threads: usize,
    /// Minimum node count before the pool is used
    pub thread_threshold: usize,
}

impl Default for PlannerOptions {
    fn default() -> Self {
        Self {
            threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            thread_threshold: DEFAULT_THREAD_THRESHOLD,
        }
    }
}

/// All-pairs shortest path planner over a fixed node count
pub struct RoutePlanner {
    nodes: usize,
    layout: Layout,
    cells: Vec<Cell>,
    /// Nodes given an explicit zero-weight self-loop
    zero_loops: Vec<bool>,
    route: Vec<NodeId>,
    pool: Option<WorkerPool>,
}

impl RoutePlanner {
    pub fn new(nodes: usize) -> Result<Self, PlannerError> {
        Self::with_options(nodes, PlannerOptions::default())
    }

    pub fn with_options(nodes: usize, options: PlannerOptions) -> Result<Self, PlannerError> {
        if nodes >= NodeId::MAX as usize {
            return Err(PlannerError::TooManyNodes(nodes));
        }
        let layout = Layout::for_nodes(nodes);
        let padded = layout.padded();
        let cell_count = padded
            .checked_mul(padded)
            .ok_or(PlannerError::TooManyNodes(nodes))?;

        let mut cells = Vec::new();
        cells
            .try_reserve_exact(cell_count)
            .map_err(|_| PlannerError::Allocation(cell_count))?;
        cells.resize(
            cell_count,
            Cell {
                weight: f32::INFINITY,
                next: 0,
            },
        );
        // Padding and unknown edges point straight at their destination column
        for i in 0..padded {
            for j in 0..padded {
                cells[layout.index(i, j)].next = j as NodeId;
            }
        }

        let pool = if nodes > options.thread_threshold && options.threads > 1 {
            match WorkerPool::new(options.threads) {
                Ok(pool) => Some(pool),
                Err(e) => {
                    warn!("Failed to start route planner workers, planning on one thread: {}", e);
                    None
                }
            }
        } else {
            None
        };

        debug!(
            "Route planner for {} nodes ({} blocks per side, pool: {})",
            nodes,
            layout.blocks,
            pool.is_some()
        );

        Ok(Self {
            nodes,
            layout,
            cells,
            zero_loops: vec![false; nodes],
            route: Vec::with_capacity(nodes),
            pool,
        })
    }

    pub fn node_count(&self) -> usize {
        self.nodes
    }

    fn check_node(&self, node: NodeId) -> Result<usize, PlannerError> {
        let idx = node as usize;
        if idx >= self.nodes {
            return Err(PlannerError::NodeOutOfRange {
                node,
                count: self.nodes,
            });
        }
        Ok(idx)
    }

    /// Record a directed edge. When an edge is set more than once the
    /// lightest weight wins.
    pub fn set_weight(&mut self, from: NodeId, to: NodeId, weight: f32) -> Result<(), PlannerError> {
        if weight.is_nan() || weight < 0.0 {
            return Err(PlannerError::InvalidWeight { from, to, weight });
        }
        let i = self.check_node(from)?;
        let j = self.check_node(to)?;
        if i == j && weight == 0.0 {
            self.zero_loops[i] = true;
        }
        let cell = &mut self.cells[self.layout.index(i, j)];
        if weight < cell.weight {
            cell.weight = weight;
            cell.next = to;
        }
        Ok(())
    }

    /// Compute all shortest paths. Ties keep the earliest path found.
    ///
    /// The diagonal is not a path: afterwards `weight(i, i)` is 0 for nodes
    /// with a zero self-loop and unreachable for every other node.
    pub fn plan(&mut self) {
        let started = Instant::now();
        let layout = self.layout;
        let cells = self.cells.as_mut_ptr();

        for round in 0..layout.blocks {
            for chunk in round_chunks(round, layout.blocks) {
                let len = chunk.len();
                if len == 0 {
                    continue;
                }
                match &self.pool {
                    Some(pool) if len > THREAD_WORK_SIZE => unsafe {
                        pool.run_chunk(cells, layout, round, chunk);
                    },
                    _ => {
                        for n in 0..len {
                            let (bi, bj) = chunk.block(n);
                            unsafe { relax_block(cells, layout, round, bi, bj) };
                        }
                    }
                }
            }
        }

        // Relaxation leaves each node's shortest cycle on the diagonal
        for (i, &zero) in self.zero_loops.iter().enumerate() {
            let cell = &mut self.cells[layout.index(i, i)];
            cell.weight = if zero { 0.0 } else { f32::INFINITY };
            cell.next = i as NodeId;
        }

        debug!(
            "Planned routes for {} nodes in {:.3}s",
            self.nodes,
            started.elapsed().as_secs_f64()
        );
    }

    /// Shortest path from `start` to `end`, inclusive of both endpoints.
    /// Returns `None` when either node is unknown or no path exists. The
    /// returned slice is reused by the next call.
    pub fn route(&mut self, start: NodeId, end: NodeId) -> Option<&[NodeId]> {
        let s = self.check_node(start).ok()?;
        let e = self.check_node(end).ok()?;

        self.route.clear();
        self.route.push(start);
        if s == e {
            return Some(&self.route);
        }
        if self.cells[self.layout.index(s, e)].weight == f32::INFINITY {
            return None;
        }

        let mut current = s;
        while current != e {
            current = self.cells[self.layout.index(current, e)].next as usize;
            self.route.push(current as NodeId);
            if self.route.len() > self.nodes {
                // Only reachable if the matrix was never planned
                return None;
            }
        }
        Some(&self.route)
    }

    /// Total weight of the shortest path, or `None` when unreachable
    pub fn weight(&self, start: NodeId, end: NodeId) -> Option<f32> {
        let s = self.check_node(start).ok()?;
        let e = self.check_node(end).ok()?;
        let w = self.cells[self.layout.index(s, e)].weight;
        (w != f32::INFINITY).then_some(w)
    }
}
