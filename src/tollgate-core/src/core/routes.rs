use crate::models::events::RouteEvent;
use crate::models::route::{GatewayRoute, RouteId};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use http::Method;
use matchit::Router;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tollgate_errors::{GatewayError, GatewayResult};
use tracing::debug;

/// Route storage keyed by business key, with optimistic concurrency on save.
#[derive(Debug, Default)]
pub struct RouteRepository {
    routes: DashMap<RouteId, GatewayRoute>,
}

impl RouteRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, id: &RouteId) -> GatewayResult<GatewayRoute> {
        self.routes
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| GatewayError::not_found(format!("route `{id}`")))
    }

    /// Stores the route and hands back the events it accumulated.
    ///
    /// A new route (never persisted) must not collide with an existing key. A
    /// loaded route is only accepted while the stored copy still has the
    /// version it was loaded at.
    pub fn save(&self, route: &mut GatewayRoute) -> GatewayResult<Vec<RouteEvent>> {
        match self.routes.entry(route.route_id().clone()) {
            Entry::Occupied(mut slot) => {
                let stored = slot.get().version();
                if route.persisted_version() == 0 {
                    return Err(GatewayError::conflict(format!("route `{}` already exists", route.route_id())));
                }
                if stored != route.persisted_version() {
                    return Err(GatewayError::ConcurrencyConflict {
                        key: route.route_id().to_string(),
                        expected: route.persisted_version(),
                        actual: stored,
                    });
                }
                route.mark_persisted();
                let events = route.take_events();
                slot.insert(route.clone());
                Ok(events)
            }
            Entry::Vacant(slot) => {
                if route.persisted_version() != 0 {
                    return Err(GatewayError::not_found(format!("route `{}` was removed", route.route_id())));
                }
                route.mark_persisted();
                let events = route.take_events();
                slot.insert(route.clone());
                Ok(events)
            }
        }
    }

    pub fn all(&self) -> Vec<GatewayRoute> {
        let mut routes: Vec<GatewayRoute> = self.routes.iter().map(|r| r.value().clone()).collect();
        routes.sort_by(|a, b| a.route_id().cmp(b.route_id()));
        routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[derive(Debug, Clone)]
pub enum RouteMatch {
    Found {
        route: Arc<GatewayRoute>,
        params: Vec<(String, String)>,
    },
    /// The path is known but no candidate accepts the method.
    MethodNotAllowed {
        allowed: Vec<String>,
    },
    NotFound,
}

type Index = Router<Vec<Arc<GatewayRoute>>>;

/// Path index over routable routes.
///
/// Routes sharing a pattern are grouped; within a group the highest priority
/// route that accepts the method wins.
pub struct RouteTable {
    index: RwLock<Arc<Index>>,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self { index: RwLock::new(Arc::new(Router::new())) }
    }
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks that a pattern is acceptable to the path index on its own.
    pub fn validate_pattern(pattern: &str) -> GatewayResult<()> {
        let mut scratch: Router<()> = Router::new();
        scratch
            .insert(pattern, ())
            .map_err(|e| GatewayError::validation(format!("invalid path pattern `{pattern}`: {e}")))
    }

    pub(crate) fn build<'a, I>(routes: I) -> GatewayResult<Index>
    where
        I: IntoIterator<Item = &'a GatewayRoute>,
    {
        let mut groups: BTreeMap<String, Vec<Arc<GatewayRoute>>> = BTreeMap::new();
        for route in routes.into_iter().filter(|r| r.is_routable()) {
            groups
                .entry(route.path_pattern().to_string())
                .or_default()
                .push(Arc::new(route.clone()));
        }

        let mut router = Router::new();
        for (pattern, mut candidates) in groups {
            candidates.sort_by(|a, b| b.priority().cmp(&a.priority()).then_with(|| a.route_id().cmp(b.route_id())));
            router
                .insert(pattern.as_str(), candidates)
                .map_err(|e| GatewayError::validation(format!("path pattern `{pattern}` rejected: {e}")))?;
        }
        Ok(router)
    }

    pub fn rebuild<'a, I>(&self, routes: I) -> GatewayResult<()>
    where
        I: IntoIterator<Item = &'a GatewayRoute>,
    {
        let index = Self::build(routes)?;
        *self.index.write() = Arc::new(index);
        Ok(())
    }

    pub fn resolve(&self, method: &Method, path: &str) -> RouteMatch {
        let index = self.index.read().clone();
        let Ok(matched) = index.at(path) else {
            debug!(%path, "no route matched");
            return RouteMatch::NotFound;
        };
        let params: Vec<(String, String)> =
            matched.params.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        match matched.value.iter().find(|r| r.allows_method(method)) {
            Some(route) => RouteMatch::Found { route: route.clone(), params },
            None => {
                let mut allowed: Vec<String> = matched.value.iter().map(|r| r.method().to_string()).collect();
                allowed.sort();
                allowed.dedup();
                RouteMatch::MethodNotAllowed { allowed }
            }
        }
    }
}
