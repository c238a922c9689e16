//! DocuSign listener - authenticated webhook gateway.
//!
//! Receives DocuSign Connect callbacks, checks the caller's bearer token
//! against the identity provider's published keys, and hands the raw payload
//! to a durable RabbitMQ queue for a downstream worker.
//!
//! ## Architecture
//!
//! ```text
//! POST /docusign_webhook → TokenValidator (KeySet) → Publisher → docusign_jobs queue
//! ```

pub mod auth;
pub mod config;
pub mod queue;
pub mod web;

// Re-export commonly used types
pub use auth::{KeyResolver, KeySet, TokenValidator};
pub use config::Config;
pub use queue::{Job, JobSink, PublishFailed, Publisher};
pub use web::{router, AppState};
