//! Execution core: node executor contract, graph walker, and the control-flow
//! primitives (fork/join, merge barrier, retry, error handling, sub-flows, loops).

pub mod board;
pub mod context;
pub mod executor;
pub mod nodes;
pub mod parallel;
pub mod report;
pub mod sleep;
pub mod validate;
pub mod walker;

pub use context::{ExecutionContext, Services, VariableMode, Variables};
pub use executor::{ExecutorRegistry, NodeExecutor};
pub use parallel::{ForkJoinManager, JoinMode};
pub use report::{NodeRecord, PathOutcome, RunFailure, RunReport};
pub use validate::validate_flow;
pub use walker::{GraphWalker, RunOptions};
