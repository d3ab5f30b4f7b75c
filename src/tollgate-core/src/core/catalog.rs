use crate::core::events::EventPublisher;
use crate::core::routes::{RouteMatch, RouteRepository, RouteTable};
use crate::models::events::RouteEvent;
use crate::models::route::{
    CircuitBreakerConfig, GatewayRoute, NewRoute, RateLimitConfig, RetryConfig, RouteChanges, RouteId,
};
use http::Method;
use parking_lot::Mutex;
use std::sync::Arc;
use tollgate_errors::GatewayResult;
use tracing::{info, warn};

/// Transaction boundary around [`GatewayRoute`] changes.
///
/// Every operation loads the route, applies one aggregate operation, saves it
/// with optimistic concurrency, refreshes the path index and only then
/// publishes the route's events. A failed step leaves the stored route, the
/// index and the event bus untouched.
pub struct RouteCatalog {
    repo: RouteRepository,
    table: RouteTable,
    publisher: Arc<dyn EventPublisher>,
    commit_lock: Mutex<()>,
}

impl RouteCatalog {
    pub fn new(publisher: Arc<dyn EventPublisher>) -> Self {
        Self { repo: RouteRepository::new(), table: RouteTable::new(), publisher, commit_lock: Mutex::new(()) }
    }

    pub fn create_route(&self, new: NewRoute, actor: &str) -> GatewayResult<GatewayRoute> {
        let mut route = GatewayRoute::create(new, actor)?;
        self.commit(&mut route)?;
        info!(route = %route.route_id(), pattern = %route.path_pattern(), "route created");
        Ok(route)
    }

    pub fn get_route(&self, id: &RouteId) -> GatewayResult<GatewayRoute> {
        self.repo.load(id)
    }

    pub fn routes(&self) -> Vec<GatewayRoute> {
        self.repo.all()
    }

    pub fn resolve(&self, method: &Method, path: &str) -> RouteMatch {
        self.table.resolve(method, path)
    }

    pub fn update_route(&self, id: &RouteId, changes: RouteChanges, actor: &str) -> GatewayResult<RouteEvent> {
        self.modify(id, |r| r.update(changes, actor))
    }

    pub fn enable_route(&self, id: &RouteId, actor: &str) -> GatewayResult<RouteEvent> {
        self.modify(id, |r| r.enable(actor))
    }

    pub fn disable_route(&self, id: &RouteId, actor: &str) -> GatewayResult<RouteEvent> {
        self.modify(id, |r| r.disable(actor))
    }

    pub fn archive_route(&self, id: &RouteId, actor: &str) -> GatewayResult<RouteEvent> {
        self.modify(id, |r| r.archive(actor))
    }

    pub fn activate_route(&self, id: &RouteId, actor: &str) -> GatewayResult<RouteEvent> {
        self.modify(id, |r| r.activate(actor))
    }

    pub fn deactivate_route(&self, id: &RouteId, actor: &str) -> GatewayResult<RouteEvent> {
        self.modify(id, |r| r.deactivate(actor))
    }

    pub fn update_rate_limit(
        &self,
        id: &RouteId,
        config: Option<RateLimitConfig>,
        actor: &str,
    ) -> GatewayResult<RouteEvent> {
        self.modify(id, |r| r.update_rate_limit(config, actor))
    }

    pub fn update_circuit_breaker(
        &self,
        id: &RouteId,
        config: Option<CircuitBreakerConfig>,
        actor: &str,
    ) -> GatewayResult<RouteEvent> {
        self.modify(id, |r| r.update_circuit_breaker(config, actor))
    }

    pub fn update_retry_policy(&self, id: &RouteId, config: Option<RetryConfig>, actor: &str) -> GatewayResult<RouteEvent> {
        self.modify(id, |r| r.update_retry_policy(config, actor))
    }

    /// Saves a route that was loaded (or created) by the caller.
    pub fn save(&self, route: &mut GatewayRoute) -> GatewayResult<Vec<RouteEvent>> {
        self.commit(route)
    }

    fn modify<F>(&self, id: &RouteId, op: F) -> GatewayResult<RouteEvent>
    where
        F: FnOnce(&mut GatewayRoute) -> GatewayResult<RouteEvent>,
    {
        let mut route = self.repo.load(id)?;
        let event = op(&mut route)?;
        self.commit(&mut route)?;
        info!(route = %id, event = event.name(), version = event.route_version, "route changed");
        Ok(event)
    }

    fn commit(&self, route: &mut GatewayRoute) -> GatewayResult<Vec<RouteEvent>> {
        let _guard = self.commit_lock.lock();
        RouteTable::validate_pattern(route.path_pattern())?;

        // the index must accept the route next to everything already stored
        let stored = self.repo.all();
        let candidate = stored
            .iter()
            .filter(|r| r.route_id() != route.route_id())
            .chain(std::iter::once(&*route));
        RouteTable::build(candidate)?;

        let events = self.repo.save(route)?;
        if let Err(e) = self.table.rebuild(self.repo.all().iter()) {
            warn!(error = %e, "route index rebuild failed, serving previous index");
        }
        self.publisher.publish(&events);
        Ok(events)
    }
}
