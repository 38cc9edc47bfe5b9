use futures::future::BoxFuture;
use serde::Serialize;

/// One readiness probe. Checks run concurrently on every `/ready` call.
pub struct NamedCheck {
    name: String,
    probe: Box<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>,
}

impl NamedCheck {
    pub fn new<F>(name: &str, probe: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, bool> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            probe: Box::new(probe),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub healthy: bool,
}

/// Composite readiness: the gateway is ready only when every registered
/// component reports healthy.
#[derive(Default)]
pub struct HealthRegistry {
    checks: Vec<NamedCheck>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, check: NamedCheck) -> Self {
        self.checks.push(check);
        self
    }

    pub async fn status(&self) -> (bool, Vec<ComponentHealth>) {
        let mut components = Vec::with_capacity(self.checks.len());
        let results =
            futures::future::join_all(self.checks.iter().map(|check| (check.probe)())).await;
        let mut all_healthy = true;
        for (check, healthy) in self.checks.iter().zip(results) {
            all_healthy &= healthy;
            components.push(ComponentHealth {
                name: check.name.clone(),
                healthy,
            });
        }
        (all_healthy, components)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn aggregates_component_status() {
        let registry = HealthRegistry::new()
            .register(NamedCheck::new("database", || Box::pin(async { true })))
            .register(NamedCheck::new("hub", || Box::pin(async { true })));
        let (healthy, components) = registry.status().await;
        assert!(healthy);
        assert_eq!(components.len(), 2);

        let registry = registry.register(NamedCheck::new("client", || Box::pin(async { false })));
        let (healthy, components) = registry.status().await;
        assert!(!healthy);
        assert!(components.iter().any(|c| c.name == "client" && !c.healthy));
    }

    #[tokio::test]
    async fn empty_registry_is_healthy() {
        let (healthy, components) = HealthRegistry::new().status().await;
        assert!(healthy);
        assert!(components.is_empty());
    }
}
