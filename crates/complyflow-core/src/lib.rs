//! # ComplyFlow Core
//!
//! Shared building blocks for the compliance-workflow orchestrator:
//! - [`ComplianceState`] — the validated, versioned case state threaded through nodes
//! - [`reducers`] — pure, append-only/additive merge functions
//! - [`StateStore`] — the checkpoint repository interface
//! - [`ComplyError`] and the retry taxonomy ([`ErrorClass`])
//! - [`ComplyConfig`] — TOML configuration

pub mod config;
pub mod error;
pub mod reducers;
pub mod state;
pub mod store;

pub use config::ComplyConfig;
pub use error::{ComplyError, ErrorClass, Result};
pub use reducers::StateUpdate;
pub use state::{
    Actor, ComplianceContext, ComplianceState, CostDelta, CostTracker, Decision, DecisionKind,
    EvidenceItem, Memory, Obligation, OrganizationProfile, WorkflowStatus,
};
pub use store::{Checkpoint, CheckpointMeta, StateStore, NO_VERSION};
