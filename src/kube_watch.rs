use futures::{Stream, StreamExt, TryStreamExt};
use k8s_openapi::api::{core::v1 as core, networking::v1 as networking};
use kube::{Client, api::Api, runtime::watcher};
use log::{debug, error, info, warn};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;

/// Something the rules depend on may have changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Service,
    NetworkPolicy,
    Tick,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Service => "services",
            Self::NetworkPolicy => "network policies",
            Self::Tick => "tick",
        })
    }
}

pub struct Config {
    pub namespace: Option<String>,
    pub client: Client,
    pub watcher_config: watcher::Config,
    /// delay before watching again after a failure
    pub backoff: Duration,
}

impl Config {
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

    pub fn watch_to(&self, tx: mpsc::Sender<Signal>) {
        tokio::spawn(self.watch::<core::Service>(tx.clone(), Signal::Service));
        tokio::spawn(self.watch::<networking::NetworkPolicy>(tx, Signal::NetworkPolicy));
    }

    fn watch<K>(&self, tx: mpsc::Sender<Signal>, signal: Signal) -> impl Future<Output = ()> + use<K>
    where
        K: kube::api::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        K: Clone + serde::de::DeserializeOwned + fmt::Debug + Send + Sync + 'static,
        <K as kube::Resource>::DynamicType: Default,
    {
        let api = self.namespaced_api::<K>();
        let resource = api.resource_url().to_string();
        let watcher_config = self.watcher_config.clone();

        watch_to_signals(
            resource,
            move || watcher(api.clone(), watcher_config.clone()).boxed(),
            self.backoff,
            tx,
            signal,
        )
    }
}

/// Forwards changes from the streams `watch` creates, creating a new one `backoff` after each
/// failure. Returns when the receiver is gone.
async fn watch_to_signals<K, S, E>(
    resource: String,
    mut watch: impl FnMut() -> S,
    backoff: Duration,
    tx: mpsc::Sender<Signal>,
    signal: Signal,
) where
    S: Stream<Item = Result<watcher::Event<K>, E>> + Unpin,
    E: fmt::Display,
{
    loop {
        info!("starting watch on {resource}");

        let mut events = watch();

        loop {
            let event = match events.try_next().await {
                Ok(Some(v)) => v,
                Ok(None) => {
                    warn!("watch on {resource} stopped");
                    break;
                }
                Err(e) => {
                    error!("watch error: {resource}: {e}");
                    break;
                }
            };

            if !is_change(&event) {
                continue;
            }

            debug!("{resource}: change notified");

            if tx.send(signal).await.is_err() {
                info!("receiver of {resource} stopped");
                return;
            }
        }

        info!("watching {resource} again in {backoff:?}");
        tokio::time::sleep(backoff).await;
    }
}

/// A (re)listing counts as one change, once complete.
fn is_change<K>(event: &watcher::Event<K>) -> bool {
    use watcher::Event::*;
    match event {
        Init | InitApply(_) => false,
        InitDone | Apply(_) | Delete(_) => true,
    }
}
