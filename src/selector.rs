//! Load-balancing selection policies.
//!
//! A selector answers "which backend address should this call use" for one
//! service path. The built-in [`WeightedSelector`] partitions backends by
//! their self-reported group memberships and picks the least-loaded candidate,
//! honoring per-call pinning hints for session affinity.

use std::{collections::HashMap, fmt};

use parking_lot::Mutex;

use crate::{discovery::KvPair, transport::Metadata};

/// Wildcard group every backend implicitly belongs to.
pub const GROUP_ALL: &str = "*";

/// Backend metadata key carrying the load-weight seed.
pub const META_BACKEND_LOAD: &str = "avg";

/// Backend metadata key carrying comma-separated group memberships.
pub const META_BACKEND_GROUPS: &str = "sid";

/// Call metadata key pinning a call to one exact backend address.
pub const META_PIN_ADDRESS: &str = "rpc-address";

/// Call metadata key pinning a call to one backend group.
pub const META_PIN_SERVER_ID: &str = "rpc-server-id";

/// Per-call routing hints, extracted from call metadata.
#[derive(Debug, Clone, Default)]
pub struct CallHints {
    /// Route to this exact address, bypassing selection entirely.
    pub address: Option<String>,

    /// Restrict candidates to this backend group.
    pub server_id: Option<String>,
}

impl CallHints {
    /// Extracts routing hints from call metadata.
    #[must_use]
    pub fn from_metadata(metadata: &Metadata) -> Self {
        Self {
            address: metadata.get(META_PIN_ADDRESS).cloned(),
            server_id: metadata.get(META_PIN_SERVER_ID).cloned(),
        }
    }

    /// Hints pinning a call to one exact backend address.
    #[must_use]
    pub fn pin_address<S: Into<String>>(address: S) -> Self {
        Self { address: Some(address.into()), server_id: None }
    }

    /// Hints restricting a call to one backend group.
    #[must_use]
    pub fn pin_server_id<S: Into<String>>(server_id: S) -> Self {
        Self { address: None, server_id: Some(server_id.into()) }
    }
}

/// A pluggable selection policy for one service path.
///
/// `select` returns `None` when no backend qualifies; callers surface that as
/// a retryable resolution failure, never a panic.
pub trait Select: Send + Sync + fmt::Debug {
    /// Picks a backend address for one call attempt.
    fn select(&self, hints: &CallHints) -> Option<String>;

    /// Replaces the selector's view of the world with a fresh discovery
    /// snapshot (keys are `service_path/address`, values are query-string
    /// encoded backend metadata).
    fn update_server(&self, snapshot: &[KvPair]);
}

/// One known backend and its call counter.
#[derive(Debug)]
struct BackendNode {
    address: String,
    load: u64,
}

/// Group id → indices into the node list.
///
/// Nodes are stored once and shared between groups by index so a load
/// increment through one group is visible through every other.
#[derive(Debug, Default)]
struct SelectorState {
    nodes: Vec<BackendNode>,
    groups: HashMap<String, Vec<usize>>,
}

/// Least-loaded selector with group partitioning.
///
/// State is rebuilt wholesale on every discovery update rather than patched
/// incrementally, so a snapshot never mixes stale and fresh backends.
#[derive(Debug)]
pub struct WeightedSelector {
    service_path: String,
    state: Mutex<SelectorState>,
}

impl WeightedSelector {
    /// Creates an empty selector for one service path.
    #[must_use]
    pub fn new<S: Into<String>>(service_path: S) -> Self {
        Self { service_path: service_path.into(), state: Mutex::new(SelectorState::default()) }
    }

    /// Returns the service path this selector serves.
    #[must_use]
    pub fn service_path(&self) -> &str {
        &self.service_path
    }
}

impl Select for WeightedSelector {
    fn select(&self, hints: &CallHints) -> Option<String> {
        if let Some(address) = &hints.address {
            return Some(address.clone());
        }

        let mut state = self.state.lock();
        let group = match &hints.server_id {
            Some(id) if state.groups.contains_key(id.as_str()) => id.as_str(),
            _ => GROUP_ALL,
        };

        let candidates = state.groups.get(group)?.clone();
        match candidates.as_slice() {
            [] => None,
            // A single candidate needs no balancing.
            [only] => Some(state.nodes[*only].address.clone()),
            _ => {
                // Strictly-less comparison keeps the first-seen node on ties.
                let mut winner: Option<usize> = None;
                for idx in candidates {
                    match winner {
                        Some(w) if state.nodes[idx].load >= state.nodes[w].load => {}
                        _ => winner = Some(idx),
                    }
                }
                let node = &mut state.nodes[winner?];
                node.load += 1;
                Some(node.address.clone())
            }
        }
    }

    fn update_server(&self, snapshot: &[KvPair]) {
        let prefix = format!("{}/", self.service_path);
        let mut next = SelectorState::default();

        for pair in snapshot {
            let Some(address) = pair.key.strip_prefix(&prefix) else {
                continue;
            };
            if address.is_empty() {
                continue;
            }

            let load = query_value(&pair.value, META_BACKEND_LOAD)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0);
            let groups: Vec<&str> = query_value(&pair.value, META_BACKEND_GROUPS)
                .map(|v| v.split(',').filter(|g| !g.is_empty()).collect())
                .unwrap_or_default();

            let idx = next.nodes.len();
            next.nodes.push(BackendNode { address: address.to_owned(), load });
            for group in groups {
                next.groups.entry(group.to_owned()).or_default().push(idx);
            }
            next.groups.entry(GROUP_ALL.to_owned()).or_default().push(idx);
        }

        let node_count = next.nodes.len();
        *self.state.lock() = next;
        tracing::debug!(
            service_path = %self.service_path,
            backends = node_count,
            "selector state rebuilt"
        );
    }
}

/// Looks up one value in a query-string encoded metadata blob.
fn query_value<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| match pair.split_once('=') {
        Some((k, v)) if k == key => Some(v),
        _ => None,
    })
}
