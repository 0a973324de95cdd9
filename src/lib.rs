//! Verified Financial Analysis Pipeline
//!
//! Answers financial-analysis questions where every number traces to code
//! that actually ran:
//! - Generated code is screened (deny-list, look-ahead bias) before it runs
//! - Execution happens in an isolated, resource-limited sandbox
//! - Only the fact extraction gate can create a `VerifiedFact`
//! - An adversarial reviewer and a multi-perspective debate adjust confidence
//! - Every stage is recorded for audit
//!
//! PIPELINE:
//! PLAN → FETCH → EXECUTE → VALIDATE → DEBATE → COMPLETE (bounded re-planning)

pub mod agent;
pub mod api;
pub mod audit;
pub mod config;
pub mod data;
pub mod debate;
pub mod error;
pub mod execution;
pub mod extraction;
pub mod gemini;
pub mod models;
pub mod planner;
pub mod safety;
pub mod state;
pub mod temporal;
pub mod verification;

pub use error::Result;

// Re-export common types
pub use agent::{Orchestrator, PipelineOutcome};
pub use models::*;
