use eyre::{Result, format_err};
use k8s_openapi::api::{core::v1 as core, networking::v1 as networking};
use kube::{
    Client,
    api::{Api, ListParams},
};
use log::debug;

use crate::snapshot::Snapshot;

/// Source of resource snapshots.
pub trait Fetch {
    fn fetch(&self) -> impl Future<Output = Result<Snapshot>> + Send;
}

/// Lists policies and services from the API server.
pub struct KubeFetcher {
    client: Client,
    namespace: Option<String>,
}

impl KubeFetcher {
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self { client, namespace }
    }

    fn namespaced_api<K>(&self) -> Api<K>
    where
        K: kube::api::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        match &self.namespace {
            None => Api::all(self.client.clone()),
            Some(ns) => Api::namespaced(self.client.clone(), ns.as_str()),
        }
    }
}

impl Fetch for KubeFetcher {
    async fn fetch(&self) -> Result<Snapshot> {
        let params = ListParams::default();

        let policies = (self.namespaced_api::<networking::NetworkPolicy>())
            .list(&params)
            .await
            .map_err(|e| format_err!("list network policies failed: {e}"))?;

        let services = (self.namespaced_api::<core::Service>())
            .list(&params)
            .await
            .map_err(|e| format_err!("list services failed: {e}"))?;

        debug!(
            "fetched {} network policies and {} services",
            policies.items.len(),
            services.items.len()
        );

        Ok(Snapshot::from_lists(policies.items, services.items))
    }
}
