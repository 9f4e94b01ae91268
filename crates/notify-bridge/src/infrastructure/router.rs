//! Route table mapping WebSocket endpoint paths to session features.
//!
//! The table is an ordinary value built by the caller and passed into the
//! server, so several bridges (or several test servers) can run in one
//! process without sharing any global registration.

use std::collections::BTreeMap;

use crate::domain::SessionFeatures;

/// Path of the notify-only endpoint.
pub const CONNECT_PATH: &str = "/connect";
/// Path of the endpoint with snapshot, registration and inbound relay.
pub const MESSAGES_PATH: &str = "/messages";

/// Maps request paths to the [`SessionFeatures`] of the sessions they start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeRouter {
    routes: BTreeMap<String, SessionFeatures>,
}

impl BridgeRouter {
    /// An empty table; every upgrade request is refused.
    pub fn new() -> Self {
        Self::default()
    }

    /// `/connect` (notify-only) and `/messages` (full variant).
    pub fn standard() -> Self {
        Self::new()
            .route(CONNECT_PATH, SessionFeatures::notify_only())
            .route(MESSAGES_PATH, SessionFeatures::messages())
    }

    /// Adds or replaces the route for `path`.
    pub fn route(mut self, path: impl Into<String>, features: SessionFeatures) -> Self {
        self.routes.insert(path.into(), features);
        self
    }

    /// Looks up the features for a request path (query string excluded).
    pub fn resolve(&self, path: &str) -> Option<SessionFeatures> {
        self.routes.get(path).copied()
    }

    /// Registered paths, sorted.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }
}
