pub mod apply;
pub mod compile;
pub mod fetch;
pub mod kube_watch;
pub mod netpol;
pub mod reconcile;
pub mod render;
pub mod rules;
pub mod service;
pub mod snapshot;
