//! Request-path middleware for the limiter.
//!
//! # Module Organization
//!
//! - [`limit`] - The LimitRate admission middleware and its builder
//!
//! The middleware integrates into Actix Web's `Transform`/`Service`
//! pipeline:
//!
//! ```text
//! Client Request → LimitRate → Route Handler → Response
//!       ↓              ↓                          ↓
//!   Identity      Peek / Commit            RateLimit-* headers
//!   Pre-flight    Verdict + Events         429 / 400 bodies
//! ```

pub mod limit;
