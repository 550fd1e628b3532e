//! Inventory of services to scale

mod validator;

pub use validator::DescriptorValidator;

use crate::error::Result;
use crate::health::ComponentHealth;
use crate::models::ServiceDescriptor;
use async_trait::async_trait;
use std::collections::HashSet;

/// Discovers the services eligible for autoscaling
#[async_trait]
pub trait ServiceSource: Send + Sync {
    async fn get_services(&self) -> Result<HashSet<ServiceDescriptor>>;

    async fn health_check(&self) -> ComponentHealth {
        ComponentHealth::healthy()
    }
}

/// Filters discovered descriptors down to the ones that can be scheduled
pub trait ServiceValidator: Send + Sync {
    fn validated_services(&self, services: HashSet<ServiceDescriptor>) -> HashSet<ServiceDescriptor>;
}
