//! The seven orchestration pattern executors (`spec.md` §3 "Pattern").
//!
//! Each submodule owns exactly one pattern's control flow and shares the
//! single-stage plumbing in `shared::StageRunner`. `engine::Executor`
//! dispatches to whichever one the loaded spec names.

pub mod chain;
pub mod evaluator_optimizer;
pub mod graph;
pub mod orchestrator_workers;
pub mod parallel;
pub mod routing;
pub mod shared;
pub mod workflow_dag;
