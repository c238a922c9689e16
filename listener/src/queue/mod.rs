//! Queue module for RabbitMQ operations.
//!
//! ```text
//! Webhook handler → Publisher (connection per job) → durable queue → downstream worker
//! ```

pub mod publisher;
pub mod types;

pub use publisher::{JobSink, PublishFailed, Publisher};
pub use types::Job;
