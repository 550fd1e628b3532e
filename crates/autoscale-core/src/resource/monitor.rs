//! Shared, rate-limited resource utilisation cache

use super::ResourceProbe;
use crate::error::Result;
use crate::models::ResourceUtilisation;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct CachedReading {
    taken_at: Instant,
    utilisation: ResourceUtilisation,
}

/// Caches the latest utilisation reading for `refresh_interval`.
///
/// Whichever caller finds the cache stale refreshes it; callers arriving
/// during the refresh wait on the write lock and reuse its result.
pub struct ResourceMonitor {
    probe: Arc<dyn ResourceProbe>,
    refresh_interval: Duration,
    cached: RwLock<Option<CachedReading>>,
}

impl ResourceMonitor {
    pub fn new(probe: Arc<dyn ResourceProbe>, refresh_interval: Duration) -> Self {
        Self {
            probe,
            refresh_interval,
            cached: RwLock::new(None),
        }
    }

    /// Current utilisation, fetched from the probe only when the cache is stale
    pub async fn current(&self) -> Result<ResourceUtilisation> {
        if let Some(utilisation) = self.fresh(&*self.cached.read().await) {
            return Ok(utilisation);
        }

        let mut cached = self.cached.write().await;
        if let Some(utilisation) = self.fresh(&cached) {
            return Ok(utilisation);
        }

        let utilisation = self.probe.resource_utilisation().await?;
        debug!(
            memory_used_percent = utilisation.memory_used_percent,
            disk_free_mb = ?utilisation.disk_free_mb,
            "Refreshed resource utilisation"
        );
        *cached = Some(CachedReading {
            taken_at: Instant::now(),
            utilisation,
        });
        Ok(utilisation)
    }

    fn fresh(&self, cached: &Option<CachedReading>) -> Option<ResourceUtilisation> {
        cached
            .filter(|reading| reading.taken_at.elapsed() < self.refresh_interval)
            .map(|reading| reading.utilisation)
    }
}
