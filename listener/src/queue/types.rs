//! Queue message type.

use axum::body::Bytes;

/// A webhook payload on its way to the queue.
///
/// The body is the raw request body, unparsed. It is published as-is with no
/// headers or metadata attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    body: Bytes,
}

impl Job {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self { body: body.into() }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}
