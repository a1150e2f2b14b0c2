//! Resolution-mode classification.
//!
//! Turns a raw configuration string into a [`ResolutionSpec`] — the immutable
//! description of how one service path resolves to backends. Classification
//! is pure: it never touches the network.

use std::sync::Arc;

use crate::{
    error::{ConfigSnafu, Result},
    selector::Select,
};

/// Resolution string routing calls inside this process.
pub const SELECTOR_TYPE_PROCESS: &str = "process";

/// Resolution string routing calls to this process's own bound address.
pub const SELECTOR_TYPE_LOCAL: &str = "local";

/// Resolution string routing calls through registry-backed discovery.
pub const SELECTOR_TYPE_DISCOVERY: &str = "discovery";

/// Selection policy attached to a registry-mode service.
#[derive(Debug, Clone)]
pub enum SelectionPolicy {
    /// Built-in rotation over all known backends.
    RoundRobin,
    /// Built-in uniform random pick.
    Random,
    /// Application-registered selector (e.g. [`crate::WeightedSelector`]).
    Custom(Arc<dyn Select>),
}

impl PartialEq for SelectionPolicy {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::RoundRobin, Self::RoundRobin) | (Self::Random, Self::Random) => true,
            // Custom policies compare by identity: a different selector
            // instance is a different resolution.
            (Self::Custom(a), Self::Custom(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// How one service path resolves to backend addresses.
///
/// Built once from configuration text and immutable afterwards; changing a
/// service's resolution produces a new spec (and, for a mode change, a new
/// client entry).
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionSpec {
    /// Short-circuit to the local handler registry, no network involved.
    InProcess,
    /// One fixed backend address.
    SingleAddress(String),
    /// A static list of backend addresses.
    AddressList(Vec<String>),
    /// Live registry-backed discovery with the given selection policy.
    Registry(SelectionPolicy),
}

/// Broad resolution family, used to decide whether a reload can rewrite a
/// live entry in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionKind {
    /// In-process dispatch.
    InProcess,
    /// Fixed address or static address list — one family, since both bind
    /// the transport to a rewritable static backend set.
    Static,
    /// Registry-backed discovery.
    Registry,
}

impl ResolutionSpec {
    /// Returns the broad family this spec belongs to.
    #[must_use]
    pub fn kind(&self) -> ResolutionKind {
        match self {
            Self::InProcess => ResolutionKind::InProcess,
            Self::SingleAddress(_) | Self::AddressList(_) => ResolutionKind::Static,
            Self::Registry(_) => ResolutionKind::Registry,
        }
    }

    /// Returns the static address set, if this is a static-family spec.
    #[must_use]
    pub fn addresses(&self) -> Option<Vec<String>> {
        match self {
            Self::SingleAddress(address) => Some(vec![address.clone()]),
            Self::AddressList(addresses) => Some(addresses.clone()),
            Self::InProcess | Self::Registry(_) => None,
        }
    }
}

/// Classifies a raw resolution string for one service path.
///
/// - `process` → [`ResolutionSpec::InProcess`]
/// - `discovery` → [`ResolutionSpec::Registry`] with the pre-registered
///   policy for this path, falling back to [`SelectionPolicy::Random`]
/// - `local` → [`ResolutionSpec::SingleAddress`] of `local_address`
/// - a comma list → [`ResolutionSpec::AddressList`]
/// - anything else → [`ResolutionSpec::SingleAddress`]
///
/// # Errors
///
/// Returns a configuration error for an empty resolution string, and for
/// `local` when no local address is configured.
pub fn classify(
    service_path: &str,
    raw_value: &str,
    local_address: Option<&str>,
    policy: Option<&Arc<dyn Select>>,
) -> Result<ResolutionSpec> {
    let value = raw_value.trim();
    if value.is_empty() {
        return ConfigSnafu {
            message: format!("empty resolution string for service '{service_path}'"),
        }
        .fail();
    }

    match value.to_ascii_lowercase().as_str() {
        SELECTOR_TYPE_PROCESS => Ok(ResolutionSpec::InProcess),
        SELECTOR_TYPE_DISCOVERY => Ok(ResolutionSpec::Registry(match policy {
            Some(selector) => SelectionPolicy::Custom(Arc::clone(selector)),
            None => SelectionPolicy::Random,
        })),
        SELECTOR_TYPE_LOCAL => match local_address {
            Some(address) => Ok(ResolutionSpec::SingleAddress(address.to_owned())),
            None => ConfigSnafu {
                message: format!(
                    "service '{service_path}' uses 'local' but no local address is configured"
                ),
            }
            .fail(),
        },
        _ if value.contains(',') => {
            let addresses: Vec<String> = value
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::to_owned)
                .collect();
            if addresses.is_empty() {
                return ConfigSnafu {
                    message: format!("address list for service '{service_path}' is empty"),
                }
                .fail();
            }
            Ok(ResolutionSpec::AddressList(addresses))
        }
        _ => Ok(ResolutionSpec::SingleAddress(value.to_owned())),
    }
}
