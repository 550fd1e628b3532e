//! Outbound alerting on resource pressure
//!
//! Alert transports (email, chat, ...) implement [`AlertDispatcher`]; the
//! [`Alerter`] rate-limits them per [`AlertCategory`].

mod alerter;

pub use alerter::Alerter;

use crate::error::Result;
use async_trait::async_trait;
use std::fmt;

/// Alert transport
#[async_trait]
pub trait AlertDispatcher: Send + Sync {
    /// Deliver one message
    async fn dispatch(&self, message: &str) -> Result<()>;

    /// Name used in logs
    fn name(&self) -> &str;
}

/// Independent rate-limiting buckets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertCategory {
    MemoryOverload,
    DiskSpaceLow,
}

impl AlertCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertCategory::MemoryOverload => "memory_overload",
            AlertCategory::DiskSpaceLow => "disk_space_low",
        }
    }
}

impl fmt::Display for AlertCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
