//! Configuration management: file loading and comprehensive validation.
//!
//! # Module Organization
//!
//! - [`settings`] - JSON configuration file loading
//! - [`validation`] - Errors / warnings / recommendations report

pub mod settings;
pub mod validation;
