//! Scaler that only acts while this autoscaler instance is active
//!
//! Standby instances keep reading instance counts and building workload
//! history, but their scale requests are dropped until they are elected.

use super::ServiceScaler;
use crate::error::Result;
use crate::health::ComponentHealth;
use crate::models::InstanceSnapshot;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

pub struct ScalerDecorator {
    inner: Arc<dyn ServiceScaler>,
    active: AtomicBool,
}

impl ScalerDecorator {
    pub fn new(inner: Arc<dyn ServiceScaler>, active: bool) -> Self {
        Self {
            inner,
            active: AtomicBool::new(active),
        }
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceScaler for ScalerDecorator {
    async fn scale_up(&self, service_id: &str, amount: u32) -> Result<()> {
        if !self.is_active() {
            debug!(service = %service_id, amount, "Standby, scale up not issued");
            return Ok(());
        }
        self.inner.scale_up(service_id, amount).await
    }

    async fn scale_down(&self, service_id: &str, amount: u32) -> Result<()> {
        if !self.is_active() {
            debug!(service = %service_id, amount, "Standby, scale down not issued");
            return Ok(());
        }
        self.inner.scale_down(service_id, amount).await
    }

    async fn get_instance_info(&self, service_id: &str) -> Result<InstanceSnapshot> {
        self.inner.get_instance_info(service_id).await
    }

    async fn health_check(&self) -> ComponentHealth {
        self.inner.health_check().await
    }
}
