//! Graph optimization passes for the Ethos-U pipeline.
//!
//! Provides a [`Pass`] trait, a [`PassManager`] with fixed-point iteration,
//! the region passes run by the backend compiler (activation fusion,
//! reshape folding, dead node elimination), int8 calibration of float
//! graphs and activation memory planning.

mod calibrate;
mod dce;
mod fuse;
pub mod memory;
pub mod quantize;
mod reshape;

pub use calibrate::{TensorRanges, quantize_graph};
pub use dce::DeadNodeElimination;
pub use fuse::FuseActivation;
pub use quantize::{QuantizeError, quantize_multiplier};
pub use reshape::FoldReshape;

use std::fmt::Debug;

use ethosu_ir::Graph;

/// A transformation over a graph.
pub trait Pass: Debug {
    /// Human-readable name of the pass.
    fn name(&self) -> &str;

    /// Run the pass on a graph. Returns `true` if anything was modified.
    fn run(&self, graph: &mut Graph) -> bool;
}

/// Optimization level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OptLevel {
    /// No optimizations.
    O0,
    /// Activation fusion, reshape folding and dead node elimination.
    #[default]
    O1,
    /// Same as O1 for now.
    O2,
}

/// Maximum number of fixed-point iterations before giving up.
const MAX_ITERATIONS: usize = 10;

/// Runs passes in sequence with fixed-point iteration.
#[derive(Debug)]
pub struct PassManager {
    passes: Vec<Box<dyn Pass>>,
}

impl Default for PassManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PassManager {
    /// Creates an empty pass manager with no passes.
    pub fn new() -> Self {
        Self { passes: Vec::new() }
    }

    /// Creates a pass manager with passes appropriate for the given level.
    pub fn for_level(level: OptLevel) -> Self {
        let mut pm = Self::new();
        match level {
            OptLevel::O0 => {}
            OptLevel::O1 | OptLevel::O2 => {
                pm.add_pass(Box::new(FuseActivation));
                pm.add_pass(Box::new(FoldReshape));
                pm.add_pass(Box::new(DeadNodeElimination));
            }
        }
        pm
    }

    /// Adds a pass to the pipeline.
    pub fn add_pass(&mut self, pass: Box<dyn Pass>) {
        self.passes.push(pass);
    }

    /// Runs all passes until a fixed point is reached or the iteration
    /// limit. Returns `true` if any pass changed the graph.
    pub fn run(&self, graph: &mut Graph) -> bool {
        let mut any = false;
        for iteration in 0..MAX_ITERATIONS {
            let mut changed = false;
            for pass in &self.passes {
                if pass.run(graph) {
                    log::debug!("pass '{}' changed the graph (iteration {iteration})", pass.name());
                    changed = true;
                }
            }
            any |= changed;
            if !changed {
                break;
            }
        }
        any
    }
}

/// Convenience function: runs O1 passes on a graph.
pub fn optimize(graph: &mut Graph) -> bool {
    PassManager::for_level(OptLevel::O1).run(graph)
}
