//! Cross-service arbitration of scaling decisions
//!
//! Every controller tick records its latest instance counts here and passes
//! its analyser's recommendation through [`Governor::govern`], which enforces
//! min/max bounds and keeps one service from growing while others are still
//! below their minimum. Under capacity pressure the governor also picks a
//! donor service to give up an instance.

use crate::error::{AutoscaleError, Result};
use crate::models::{
    InstanceSnapshot, ResourceLimitStagesReached, ScalingAction, ScalingOperation,
    ServiceDescriptor,
};
use crate::observability::AutoscaleMetrics;
use crate::resource::ShutdownThresholds;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Weak;
use tracing::{debug, error, info, warn};

/// Fraction of its instances a service keeps per tick while others are
/// below their minimum
const REDUCE_TO_FRACTION: f64 = 0.90;

/// A service that can give up instances on request
#[async_trait]
pub trait CapacityDonor: Send + Sync {
    async fn scale_down_now(&self, amount: u32) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
struct GovernorRecord {
    snapshot: InstanceSnapshot,
    /// Instance count the service last asked for
    desired: u32,
}

impl GovernorRecord {
    /// desired / total; a service with nothing running and nothing wanted
    /// ranks above every finite ratio
    fn relative_difference(&self) -> f64 {
        let total = self.snapshot.total();
        if total == 0 && self.desired == 0 {
            return f64::INFINITY;
        }
        self.desired as f64 / total as f64
    }
}

fn desired_instances(snapshot: &InstanceSnapshot, action: &ScalingAction) -> u32 {
    match action.operation {
        ScalingOperation::None => snapshot.total(),
        ScalingOperation::ScaleUp => snapshot.running.saturating_add(action.amount),
        ScalingOperation::ScaleDown => snapshot.running.saturating_sub(action.amount),
    }
}

/// Final action for a service given its bounds and whether every other
/// service is at or above its minimum
fn arbitrate(
    action: ScalingAction,
    total: u32,
    min: u32,
    max: u32,
    others_minimums_met: bool,
) -> ScalingAction {
    if total > max {
        return ScalingAction::scale_down(total - max);
    }

    match action.operation {
        ScalingOperation::None => {
            if total < min {
                ScalingAction::scale_up(min - total)
            } else {
                action
            }
        }
        ScalingOperation::ScaleUp => {
            if others_minimums_met {
                ScalingAction::scale_up(action.amount.min(max - total))
            } else if total < min {
                ScalingAction::scale_up(min - total)
            } else if total == min {
                ScalingAction::NO_ACTION
            } else {
                let target = min.max((total as f64 * REDUCE_TO_FRACTION).floor() as u32);
                ScalingAction::scale_down(total - target)
            }
        }
        ScalingOperation::ScaleDown => {
            if total == min {
                ScalingAction::NO_ACTION
            } else if total < min {
                ScalingAction::scale_up(min - total)
            } else if action.amount > total - min {
                ScalingAction::scale_down(total - min)
            } else {
                action
            }
        }
    }
}

pub struct Governor {
    configs: DashMap<String, ServiceDescriptor>,
    records: DashMap<String, GovernorRecord>,
    donors: DashMap<String, Weak<dyn CapacityDonor>>,
    thresholds: ShutdownThresholds,
    metrics: AutoscaleMetrics,
}

impl Governor {
    pub fn new(thresholds: ShutdownThresholds, metrics: AutoscaleMetrics) -> Self {
        Self {
            configs: DashMap::new(),
            records: DashMap::new(),
            donors: DashMap::new(),
            thresholds,
            metrics,
        }
    }

    /// Upsert the configuration of a service
    pub fn register(&self, descriptor: &ServiceDescriptor) {
        self.configs.insert(descriptor.id.clone(), descriptor.clone());
    }

    /// Register the controller asked to give up capacity for `service_id`
    pub fn register_listener(&self, service_id: &str, donor: Weak<dyn CapacityDonor>) {
        self.donors.insert(service_id.to_string(), donor);
    }

    /// Forget everything about a service
    pub fn remove(&self, service_id: &str) {
        self.configs.remove(service_id);
        self.records.remove(service_id);
        self.donors.remove(service_id);
    }

    pub fn is_registered(&self, service_id: &str) -> bool {
        self.configs.contains_key(service_id)
    }

    /// Store the latest instance counts; the last desired count is kept.
    ///
    /// Ignored for services that are not registered, so a tick still in
    /// flight after [`Governor::remove`] leaves nothing behind.
    pub fn record_instances(&self, service_id: &str, snapshot: InstanceSnapshot) {
        if !self.configs.contains_key(service_id) {
            debug!(service = %service_id, "Ignoring instances of unregistered service");
            return;
        }
        self.records
            .entry(service_id.to_string())
            .and_modify(|record| record.snapshot = snapshot)
            .or_insert(GovernorRecord {
                snapshot,
                desired: snapshot.total(),
            });
    }

    pub fn relative_difference(&self, service_id: &str) -> Option<f64> {
        self.records
            .get(service_id)
            .map(|record| record.relative_difference())
    }

    /// Arbitrate a requested action into the one to apply.
    ///
    /// Fails only if the service was never registered. Without a recorded
    /// snapshot the request is returned unchanged.
    pub fn govern(
        &self,
        service_id: &str,
        action: ScalingAction,
        stages: ResourceLimitStagesReached,
    ) -> Result<ScalingAction> {
        let (min, max) = self
            .configs
            .get(service_id)
            .map(|config| (config.min_instances, config.max_instances))
            .ok_or_else(|| AutoscaleError::NotRegistered(service_id.to_string()))?;

        let snapshot = match self.records.get_mut(service_id) {
            Some(mut record) => {
                record.desired = desired_instances(&record.snapshot, &action);
                record.snapshot
            }
            None => return Ok(action),
        };

        let others_met = self.other_services_minimums_met(service_id, stages);
        let governed = arbitrate(action, snapshot.total(), min, max, others_met);

        if governed != action {
            self.metrics.inc_governor_override();
            debug!(
                service = %service_id,
                requested = %action,
                governed = %governed,
                total = snapshot.total(),
                min,
                max,
                others_minimums_met = others_met,
                "Governor overrode scaling action"
            );
        }
        Ok(governed)
    }

    /// Other services below their minimum block growth, unless they were
    /// deliberately shed at the current resource stage
    fn other_services_minimums_met(
        &self,
        service_id: &str,
        stages: ResourceLimitStagesReached,
    ) -> bool {
        let others: Vec<(String, u32)> = self
            .configs
            .iter()
            .filter(|entry| entry.key() != service_id)
            .map(|entry| (entry.key().clone(), entry.min_instances))
            .collect();

        let stage = stages.highest();
        for (id, min) in others {
            let snapshot = match self.records.get(&id) {
                Some(record) => record.snapshot,
                // Not reported yet: assume it still needs its minimum
                None => return false,
            };
            if snapshot.total() < min && !self.thresholds.should_shed(stage, snapshot.shutdown_priority) {
                return false;
            }
        }
        true
    }

    /// Ask the most over-provisioned other service to give up one instance.
    ///
    /// Only services whose relative difference is below the requester's and
    /// which run above their own minimum qualify. Returns whether a donor was
    /// found and scaled down.
    pub async fn free_up_resources_for_service(&self, service_id: &str) -> bool {
        let requester = match self.relative_difference(service_id) {
            Some(ratio) => ratio,
            None => {
                error!(service = %service_id, "No recorded instances, cannot free up resources");
                return false;
            }
        };

        let candidates: Vec<(String, f64, u32)> = self
            .records
            .iter()
            .filter(|entry| entry.key() != service_id)
            .map(|entry| {
                (
                    entry.key().clone(),
                    entry.relative_difference(),
                    entry.snapshot.total(),
                )
            })
            .collect();

        let donor_id = candidates
            .into_iter()
            .filter(|(id, ratio, total)| {
                *ratio < requester
                    && self
                        .configs
                        .get(id)
                        .map(|config| config.min_instances < *total)
                        .unwrap_or(false)
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(id, _, _)| id);

        let donor_id = match donor_id {
            Some(id) => id,
            None => {
                info!(
                    service = %service_id,
                    "Unable to make room, every other service is closer to its desired instances"
                );
                return false;
            }
        };

        let donor = self.donors.get(&donor_id).and_then(|weak| weak.upgrade());
        let donor = match donor {
            Some(donor) => donor,
            None => {
                warn!(service = %service_id, donor = %donor_id, "Donor has no running controller");
                return false;
            }
        };

        info!(
            event = "capacity_donation",
            service = %service_id,
            donor = %donor_id,
            "Scaling down donor to make room"
        );
        match donor.scale_down_now(1).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    service = %service_id,
                    donor = %donor_id,
                    error = %e,
                    "Donor failed to scale down"
                );
                false
            }
        }
    }
}
