use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::router::{Router, RouterState};

/// Registry of live routers, keyed by stream path (e.g. `/live/cam1`).
///
/// Cloning shares the same map. Each registry is an independent lock
/// domain, so several relays can coexist in one process.
#[derive(Clone, Default)]
pub struct RouterRegistry {
    routers: Arc<RwLock<HashMap<String, Arc<Router>>>>,
}

impl RouterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a router by exact path, stopped or not.
    pub fn get(&self, path: &str) -> Option<Arc<Router>> {
        self.routers.read().get(path).cloned()
    }

    /// Look up a router that still accepts subscribers.
    pub fn get_live(&self, path: &str) -> Option<Arc<Router>> {
        self.get(path)
            .filter(|router| router.state() != RouterState::Stopped)
    }

    /// Register `router` unless a live one already serves `path`.
    ///
    /// Returns whichever router ends up registered. A stopped router at the
    /// same path is replaced.
    pub fn register(&self, path: &str, router: Arc<Router>) -> Arc<Router> {
        let mut routers = self.routers.write();
        if let Some(existing) = routers.get(path) {
            if existing.state() != RouterState::Stopped {
                return existing.clone();
            }
        }
        routers.insert(path.to_string(), router.clone());
        tracing::info!(path, total = routers.len(), "router registered");
        router
    }

    pub fn remove(&self, path: &str) -> Option<Arc<Router>> {
        let removed = self.routers.write().remove(path);
        if removed.is_some() {
            tracing::debug!(path, "router removed");
        }
        removed
    }

    /// Remove the entry for `path` only if it is still `router`, so a
    /// replacement registered meanwhile survives.
    pub fn remove_router(&self, path: &str, router: &Arc<Router>) -> bool {
        let mut routers = self.routers.write();
        let matches = routers
            .get(path)
            .is_some_and(|existing| Arc::ptr_eq(existing, router));
        if matches {
            routers.remove(path);
            tracing::debug!(path, remaining = routers.len(), "stopped router removed");
        }
        matches
    }

    /// Remove every router, returning them for shutdown.
    pub fn drain(&self) -> Vec<Arc<Router>> {
        self.routers.write().drain().map(|(_, router)| router).collect()
    }

    pub fn len(&self) -> usize {
        self.routers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routers.read().is_empty()
    }
}

/// Extract the stream path from a stream URL.
///
/// `rtmp://host:1935/live/cam1`      → `/live/cam1`
/// `rtmp://host/live/cam1/?token=x`  → `/live/cam1`
/// `file:///tmp/clip.h264`           → `/tmp/clip.h264`
/// `rtmp://host/cam1`                → `None` (fewer than two segments)
pub fn extract_stream_path(url: &str) -> Option<String> {
    let path = match url.find("://") {
        Some(pos) => {
            let after = &url[pos + 3..];
            &after[after.find('/')?..]
        }
        None if url.starts_with('/') => url,
        None => return None,
    };

    let path = path.split(['?', '#']).next().unwrap_or_default();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() < 2 {
        return None;
    }
    Some(format!("/{}", segments.join("/")))
}

/// Stream id: the last segment of a stream path.
pub fn stream_id(path: &str) -> &str {
    path.rsplit('/').find(|s| !s.is_empty()).unwrap_or(path)
}
