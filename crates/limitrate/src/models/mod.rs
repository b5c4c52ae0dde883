//! Data models for the limiter: the policy tree, verdicts, events, errors,
//! and the serde configuration schema.
//!
//! # Module Organization
//!
//! - [`policy`] - Plans, endpoint policies, actions, and windows
//! - [`verdict`] - Admission verdicts and per-window observations
//! - [`event`] - Typed records handed to the event sink
//! - [`error`] - Error taxonomy with HTTP response mappings
//! - [`settings`] - Serde model of the configuration file

pub mod error;
pub mod event;
pub mod policy;
pub mod settings;
pub mod verdict;
