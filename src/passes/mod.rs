// Graph transformation passes
//
// Each pass is a composable rewrite applied to a Graph in place.

mod bf16;

pub use bf16::{lower_to_bf16, Bf16Lowering};

use crate::error::Result;
use crate::graph::Graph;

/// Graph rewrite pass trait
pub trait GraphPass {
    /// Get the name of this pass (for logging/debugging)
    fn name(&self) -> &str;

    /// Run the pass on the graph.
    ///
    /// Returns `true` if the graph was modified, `false` otherwise.
    fn run(&self, graph: &mut Graph) -> Result<bool>;
}
