//! Health reporting for the worker process.
//!
//! The worker loop is the only long-lived component, but the registry keeps
//! the component map anyway so a deployment can register extra probes (e.g.
//! a producer). A component is healthy while its last report is younger
//! than its deadline; a stale report flips the whole process unhealthy.

use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::{Duration, OffsetDateTime};
use tracing::info;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Automatically set when a component is newly registered
    Starting,
    /// Recently reported healthy, will need to report again before the date
    HealthyUntil(OffsetDateTime),
    /// Reported unhealthy
    Unhealthy,
    /// Automatically set when the HealthyUntil deadline is reached
    Stalled,
}

#[derive(Default, Debug)]
pub struct HealthStatus {
    /// The overall status: true if all components are healthy
    pub healthy: bool,
    /// Current status of each registered component, for display
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    /// Computes the axum status code based on the overall health status,
    /// and prints each component status in the body for debugging.
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

type ComponentMap = Arc<RwLock<HashMap<String, ComponentStatus>>>;

fn read_components(components: &ComponentMap) -> HashMap<String, ComponentStatus> {
    match components.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

fn write_component(components: &ComponentMap, component: &str, status: ComponentStatus) {
    let mut guard = match components.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    guard.insert(component.to_owned(), status);
}

/// A handle held by one component to report its own status.
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: ComponentMap,
}

impl HealthHandle {
    /// Report healthy. Must be called more frequently than the configured
    /// deadline.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc().add(self.deadline),
        ));
    }

    pub fn report_status(&self, status: ComponentStatus) {
        write_component(&self.components, &self.component, status);
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: ComponentMap,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a component and get the handle it reports through.
    pub fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        info!(
            registry = self.name,
            component, "registering component for health reporting"
        );
        write_component(&self.components, &component, ComponentStatus::Starting);
        HealthHandle {
            component,
            deadline,
            components: self.components.clone(),
        }
    }

    /// Fold the component map into the process-wide status.
    pub fn get_status(&self) -> HealthStatus {
        let now = OffsetDateTime::now_utc();
        let mut healthy = true;
        let components = read_components(&self.components)
            .into_iter()
            .map(|(component, status)| {
                let status = match status {
                    ComponentStatus::HealthyUntil(until) if until > now => {
                        ComponentStatus::HealthyUntil(until)
                    }
                    ComponentStatus::HealthyUntil(_) => ComponentStatus::Stalled,
                    other => other,
                };
                if !matches!(status, ComponentStatus::HealthyUntil(_)) {
                    healthy = false;
                }
                (component, status)
            })
            .collect::<HashMap<_, _>>();

        HealthStatus {
            healthy: healthy && !components.is_empty(),
            components,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_registry_is_unhealthy() {
        let registry = HealthRegistry::new("liveness");

        assert!(!registry.get_status().healthy);
    }

    #[test]
    fn test_component_starts_unhealthy_and_reports_in() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("worker".to_owned(), Duration::seconds(30));

        assert!(!registry.get_status().healthy);

        handle.report_healthy();
        let status = registry.get_status();
        assert!(status.healthy);
        assert!(matches!(
            status.components.get("worker"),
            Some(ComponentStatus::HealthyUntil(_))
        ));
    }

    #[test]
    fn test_missed_deadline_stalls_the_component() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("worker".to_owned(), Duration::seconds(-1));

        handle.report_healthy();

        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("worker"),
            Some(&ComponentStatus::Stalled)
        );
    }

    #[test]
    fn test_one_unhealthy_component_fails_the_process() {
        let registry = HealthRegistry::new("liveness");
        let worker = registry.register("worker".to_owned(), Duration::seconds(30));
        let other = registry.register("producer".to_owned(), Duration::seconds(30));

        worker.report_healthy();
        other.report_status(ComponentStatus::Unhealthy);

        assert!(!registry.get_status().healthy);
    }
}
