//! Thread-safe resource map served by the harness.
//!
//! Scenario setup registers payloads from the orchestrating task while the
//! file server task looks them up.  Every public method is one critical
//! section; the guard never leaves this module.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("no resource registered at {0}")]
    NotFound(String),
}

/// A registered path and its bytes.
#[derive(Debug, Clone)]
pub struct Resource {
    pub path: String,
    pub payload: Arc<[u8]>,
}

/// Shared path → payload map, plus what is needed to build absolute URIs.
#[derive(Debug, Clone)]
pub struct ResourceStore {
    inner: Arc<Mutex<StoreInner>>,
}

#[derive(Debug)]
struct StoreInner {
    resources: HashMap<String, Resource>,
    authority: SocketAddr,
    scheme: &'static str,
}

impl ResourceStore {
    /// Empty store for an endpoint bound to `authority` using `scheme`
    /// (`coap` or `coaps`).
    pub fn new(authority: SocketAddr, scheme: &'static str) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                resources: HashMap::new(),
                authority,
                scheme,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        // Each critical section is a single map operation, so poisoning is ignored.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_resource(&self, path: &str, payload: impl Into<Arc<[u8]>>) {
        let path = normalize_path(path);
        let resource = Resource {
            path: path.clone(),
            payload: payload.into(),
        };
        log::debug!(
            "[store] {} -> {} bytes",
            resource.path,
            resource.payload.len()
        );
        self.lock().resources.insert(path, resource);
    }

    pub fn get_resource(&self, path: &str) -> Result<Arc<[u8]>, StoreError> {
        let path = normalize_path(path);
        self.lock()
            .resources
            .get(&path)
            .map(|r| Arc::clone(&r.payload))
            .ok_or(StoreError::NotFound(path))
    }

    pub fn remove_resource(&self, path: &str) -> Option<Resource> {
        self.lock().resources.remove(&normalize_path(path))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.lock().resources.contains_key(&normalize_path(path))
    }

    /// Absolute URI of `path` on the bound address.
    pub fn resource_uri(&self, path: &str) -> String {
        let inner = self.lock();
        format_uri(inner.scheme, inner.authority, &normalize_path(path))
    }

    /// Register `payload` at `path` and return its URI, under one lock.
    pub fn register(&self, path: &str, payload: impl Into<Arc<[u8]>>) -> String {
        let path = normalize_path(path);
        let payload = payload.into();
        let mut inner = self.lock();
        inner.resources.insert(
            path.clone(),
            Resource {
                path: path.clone(),
                payload,
            },
        );
        format_uri(inner.scheme, inner.authority, &path)
    }
}

/// Paths are stored with exactly one leading slash and no trailing slash
/// (except the root itself).
pub fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

fn format_uri(scheme: &str, authority: SocketAddr, path: &str) -> String {
    // SocketAddr's Display already brackets IPv6 hosts.
    format!("{scheme}://{authority}{path}")
}
