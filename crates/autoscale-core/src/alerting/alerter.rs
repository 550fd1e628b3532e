//! Per-category alert rate limiting

use super::{AlertCategory, AlertDispatcher};
use crate::config::AlertDispatchSettings;
use crate::error::Result;
use crate::observability::AutoscaleMetrics;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

/// Alert emitter with a minimum interval between dispatches of one category
pub struct Alerter {
    dispatchers: Vec<Arc<dyn AlertDispatcher>>,
    /// Minimum time between two dispatches of the same category
    frequency: Duration,
    disabled: bool,
    /// Category -> last successful dispatch; held across the send so
    /// concurrent callers cannot both pass the window check
    last_dispatch: Mutex<HashMap<AlertCategory, Instant>>,
    metrics: AutoscaleMetrics,
}

impl Alerter {
    pub fn new(
        dispatchers: Vec<Arc<dyn AlertDispatcher>>,
        settings: &AlertDispatchSettings,
        metrics: AutoscaleMetrics,
    ) -> Self {
        Self {
            dispatchers,
            frequency: settings.frequency(),
            disabled: settings.disable_alert_dispatch,
            last_dispatch: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Override the dispatch frequency
    pub fn with_frequency(mut self, frequency: Duration) -> Self {
        self.frequency = frequency;
        self
    }

    /// Send `message` to every dispatcher unless this category fired recently.
    ///
    /// Returns whether the alert went out. A dispatcher failure is returned
    /// after earlier dispatchers already delivered the message.
    pub async fn dispatch_alert(&self, category: AlertCategory, message: &str) -> Result<bool> {
        if self.disabled || self.dispatchers.is_empty() {
            return Ok(false);
        }

        let mut last_dispatch = self.last_dispatch.lock().await;
        if let Some(last) = last_dispatch.get(&category) {
            if last.elapsed() < self.frequency {
                debug!(category = %category, "Alert suppressed, dispatched recently");
                return Ok(false);
            }
        }

        for dispatcher in &self.dispatchers {
            debug!(category = %category, dispatcher = dispatcher.name(), "Dispatching alert");
            dispatcher.dispatch(message).await?;
        }
        last_dispatch.insert(category, Instant::now());

        info!(
            event = "alert_dispatched",
            category = %category,
            dispatchers = self.dispatchers.len(),
            "Alert dispatched"
        );
        self.metrics.inc_alert_dispatched(category.as_str());
        Ok(true)
    }
}
