use k8s_openapi::api::{core::v1 as core, networking::v1 as networking};
use std::collections::BTreeMap as Map;

use crate::{netpol::Policy, service::ExposedService};

pub mod keys;

/// Decodes a kubernetes object into a keyed value. Objects that don't yield both a key and a
/// value are not part of the snapshot.
pub trait KeyValueFrom<V>: Sized {
    type Key: Ord;
    fn key_from(v: &V) -> Option<Self::Key>;
    fn value_from(v: V) -> Option<Self>;
}

/// Point-in-time view of the cluster objects the rules are compiled from.
///
/// Maps are keyed by (namespace, name), so iteration is deterministic.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Snapshot {
    pub policies: Map<keys::Object, Policy>,
    pub services: Map<keys::Object, ExposedService>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_lists(
        policies: impl IntoIterator<Item = networking::NetworkPolicy>,
        services: impl IntoIterator<Item = core::Service>,
    ) -> Self {
        Self {
            policies: collect(policies),
            services: collect(services),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty() && self.services.is_empty()
    }
}

fn collect<V, T: KeyValueFrom<V>>(items: impl IntoIterator<Item = V>) -> Map<T::Key, T> {
    let mut map = Map::new();
    for item in items {
        if let (Some(key), Some(value)) = (T::key_from(&item), T::value_from(item)) {
            map.insert(key, value);
        }
    }
    map
}
