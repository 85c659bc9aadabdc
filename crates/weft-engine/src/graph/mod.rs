//! Workflow graph: compilation of definitions into an indexed DAG, and the
//! binding expressions evaluated against a run's context.
//!
//! Steps live in a dense `Vec` addressed by [`NodeId`]; each node carries both
//! its dependency and dependent lists so the executor can update the ready set
//! in constant time per finished step.

pub mod compiler;
pub mod expr;

pub use compiler::{
    compile, CompiledBinding, DagDescription, DagEdge, DagNode, ExecutionGraph, GraphNode,
    NodeId, StepKind,
};
pub use expr::{evaluate, Expression};
