//! Platform resource pressure
//!
//! The [`ResourceMonitor`] caches readings from a [`ResourceProbe`] for all
//! controllers; [`StageClassifier`] turns a reading into resource limit stages.

mod monitor;
mod stage;

pub use monitor::ResourceMonitor;
pub use stage::{ShutdownThresholds, StageClassifier};

use crate::error::Result;
use crate::models::ResourceUtilisation;
use async_trait::async_trait;

/// Source of platform-wide resource utilisation (e.g. the message broker's
/// memory watermark and free disk)
#[async_trait]
pub trait ResourceProbe: Send + Sync {
    async fn resource_utilisation(&self) -> Result<ResourceUtilisation>;
}
