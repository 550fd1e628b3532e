//! Platform scaler interface
//!
//! Concrete scalers (container orchestrators) live outside this crate and
//! implement [`ServiceScaler`].

mod decorator;

pub use decorator::ScalerDecorator;

use crate::error::Result;
use crate::health::ComponentHealth;
use crate::models::InstanceSnapshot;
use async_trait::async_trait;

/// Changes and reads the instance count of services on the platform.
///
/// Calls must be safe to repeat with the same amount.
#[async_trait]
pub trait ServiceScaler: Send + Sync {
    async fn scale_up(&self, service_id: &str, amount: u32) -> Result<()>;

    async fn scale_down(&self, service_id: &str, amount: u32) -> Result<()>;

    async fn get_instance_info(&self, service_id: &str) -> Result<InstanceSnapshot>;

    async fn health_check(&self) -> ComponentHealth {
        ComponentHealth::healthy()
    }
}
