//! Evidence-Based Workflow Proposal Pipeline
//!
//! The subsystem that turns repeated dissatisfaction signals into
//! governed, human-approved workflow proposals:
//!
//! 1. **Evidence & patterns**: signals are normalized into signatures and
//!    deduplicated into need patterns with weighted aggregates
//! 2. **Scheduler**: rate-limited dispatch of qualifying patterns
//! 3. **Synthesizer**: deterministic workflow graph assembly
//! 4. **Governor**: four-axis risk scoring with veto power
//! 5. **Review & publish**: human approval, sandbox testing, promotion
//!    into the production catalog

pub mod governor;
pub mod graph;
pub mod queue;
pub mod scheduler;
pub mod service;
pub mod signature;
pub mod store;
pub mod synthesizer;
pub mod thresholds;
pub mod types;

// Re-export main types for convenient access
pub use service::PipelineService;
pub use store::PipelineStore;
