//! HTTP handlers, one module per API area.

pub mod admin;
pub mod alertmanager;
pub mod health;
pub mod prometheus;
pub mod provisioning;
pub mod ruler;
pub mod silences;

use serde::Serialize;

/// Body of responses that only carry a message.
#[derive(Debug, Clone, Serialize)]
pub struct MessageResponse {
    /// Human-readable outcome.
    pub message: String,
}

impl MessageResponse {
    /// Creates a message body.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
