//! Process-wide registry of live resource handles.
//!
//! Every file descriptor, network client, or compression context the
//! pipeline opens is registered here at creation and deregistered on close,
//! so shutdown can account for handles deterministically. The registry is
//! explicitly owned (constructed once, shared by `Arc`), not ambient state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// What kind of handle a registration represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    File,
    NetworkClient,
    Compression,
    Timer,
}

impl ResourceKind {
    fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::File => "file",
            ResourceKind::NetworkClient => "network-client",
            ResourceKind::Compression => "compression",
            ResourceKind::Timer => "timer",
        }
    }
}

/// Opaque handle returned by [`ResourceRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(u64);

#[derive(Debug, Clone)]
struct Registration {
    kind: ResourceKind,
    label: String,
}

/// Mutex-protected handle table; registration and deregistration are O(1).
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, Registration>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: ResourceKind, label: impl Into<String>) -> ResourceId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let label = label.into();
        tracing::debug!(kind = kind.as_str(), %label, id, "resource registered");
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id, Registration { kind, label });
        ResourceId(id)
    }

    pub fn deregister(&self, id: ResourceId) {
        if let Some(entry) =
            self.entries.lock().unwrap_or_else(|p| p.into_inner()).remove(&id.0)
        {
            tracing::debug!(kind = entry.kind.as_str(), label = %entry.label, "resource deregistered");
        }
    }

    pub fn active_count(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Drain at shutdown: removes and reports every handle still registered.
    /// A non-empty result means some component skipped its close path.
    pub fn drain(&self) -> Vec<(ResourceKind, String)> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let leaked: Vec<_> =
            entries.drain().map(|(_, e)| (e.kind, e.label)).collect();
        for (kind, label) in &leaked {
            tracing::warn!(kind = kind.as_str(), %label, "resource still registered at shutdown");
        }
        leaked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_deregister() {
        let registry = ResourceRegistry::new();
        let a = registry.register(ResourceKind::File, "app.log");
        let b = registry.register(ResourceKind::NetworkClient, "otlp endpoint");
        assert_eq!(registry.active_count(), 2);

        registry.deregister(a);
        assert_eq!(registry.active_count(), 1);
        // Deregistering twice is harmless.
        registry.deregister(a);
        assert_eq!(registry.active_count(), 1);
        registry.deregister(b);
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn drain_reports_leaked_handles() {
        let registry = ResourceRegistry::new();
        registry.register(ResourceKind::File, "app.log");
        registry.register(ResourceKind::Compression, "rotate gzip");
        let leaked = registry.drain();
        assert_eq!(leaked.len(), 2);
        assert_eq!(registry.active_count(), 0);
        assert!(registry.drain().is_empty());
    }

    #[test]
    fn ids_are_unique() {
        let registry = ResourceRegistry::new();
        let a = registry.register(ResourceKind::Timer, "batch timer");
        let b = registry.register(ResourceKind::Timer, "probe timer");
        assert_ne!(a, b);
    }
}
