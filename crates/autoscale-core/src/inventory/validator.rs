use super::ServiceValidator;
use crate::models::ServiceDescriptor;
use std::collections::HashSet;
use tracing::warn;

/// Drops descriptors with an unknown workload metric or broken limits
#[derive(Debug, Clone)]
pub struct DescriptorValidator {
    known_metrics: HashSet<String>,
}

impl DescriptorValidator {
    pub fn new<I, S>(known_metrics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            known_metrics: known_metrics.into_iter().map(Into::into).collect(),
        }
    }

    fn violation(&self, descriptor: &ServiceDescriptor) -> Option<String> {
        if descriptor.id.is_empty() {
            return Some("empty service id".to_string());
        }
        if descriptor.scaling_target.is_empty() {
            return Some("empty scaling target".to_string());
        }
        if descriptor.interval_secs == 0 {
            return Some("interval must be at least 1 second".to_string());
        }
        if descriptor.max_instances == 0 {
            return Some("max instances must be at least 1".to_string());
        }
        if descriptor.min_instances > descriptor.max_instances {
            return Some(format!(
                "min instances {} exceeds max instances {}",
                descriptor.min_instances, descriptor.max_instances
            ));
        }
        if !self.known_metrics.contains(&descriptor.workload_metric) {
            return Some(format!("unknown workload metric '{}'", descriptor.workload_metric));
        }
        None
    }
}

impl ServiceValidator for DescriptorValidator {
    fn validated_services(&self, services: HashSet<ServiceDescriptor>) -> HashSet<ServiceDescriptor> {
        services
            .into_iter()
            .filter(|descriptor| match self.violation(descriptor) {
                Some(reason) => {
                    warn!(service = %descriptor.id, reason = %reason, "Ignoring invalid service");
                    false
                }
                None => true,
            })
            .collect()
    }
}
