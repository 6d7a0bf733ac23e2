use crate::snapshot::{KeyValueFrom, keys};

use k8s_openapi::api::core::v1 as core;

/// A Service reachable from outside the cluster (LoadBalancer or NodePort).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExposedService {
    /// `loadBalancerSourceRanges`; empty means any source.
    pub source_ranges: Vec<String>,
    /// Explicit load-balancer IP followed by the status-reported ingress IPs.
    pub addresses: Vec<String>,
    pub ports: Vec<Port>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Port {
    pub protocol: Option<String>,
    pub port: i32,
}

impl KeyValueFrom<core::Service> for ExposedService {
    type Key = keys::Object;

    fn key_from(v: &core::Service) -> Option<Self::Key> {
        keys::Object::try_from(&v.metadata).ok()
    }

    fn value_from(v: core::Service) -> Option<Self> {
        let spec = v.spec?;

        match spec.type_.as_deref() {
            Some("LoadBalancer" | "NodePort") => {}
            _ => return None,
        }

        let mut addresses: Vec<String> = spec.load_balancer_ip.into_iter().collect();

        let lb_ingress = (v.status)
            .and_then(|status| status.load_balancer)
            .and_then(|lb| lb.ingress)
            .unwrap_or_default();
        addresses.extend(lb_ingress.into_iter().filter_map(|ingress| ingress.ip));

        addresses.retain(|ip| !ip.is_empty());

        Some(Self {
            source_ranges: spec.load_balancer_source_ranges.unwrap_or_default(),
            addresses,
            ports: (spec.ports.unwrap_or_default().into_iter())
                .map(|port| Port {
                    protocol: port.protocol,
                    port: port.port,
                })
                .collect(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn service(v: serde_json::Value) -> core::Service {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_load_balancer() {
        let svc = service(json!({
            "metadata": { "namespace": "web", "name": "front" },
            "spec": {
                "type": "LoadBalancer",
                "loadBalancerIP": "203.0.113.10",
                "loadBalancerSourceRanges": ["198.51.100.0/24"],
                "ports": [
                    { "port": 443, "protocol": "TCP" },
                    { "port": 53, "protocol": "UDP" },
                ],
            },
            "status": {
                "loadBalancer": { "ingress": [{ "ip": "203.0.113.11" }, { "hostname": "lb.example" }] }
            }
        }));

        let exposed = ExposedService::value_from(svc).unwrap();
        assert_eq!(exposed.source_ranges, vec!["198.51.100.0/24".to_string()]);
        assert_eq!(
            exposed.addresses,
            vec!["203.0.113.10".to_string(), "203.0.113.11".to_string()]
        );
        assert_eq!(
            exposed.ports,
            vec![
                Port {
                    protocol: Some("TCP".into()),
                    port: 443
                },
                Port {
                    protocol: Some("UDP".into()),
                    port: 53
                },
            ]
        );
    }

    #[test]
    fn test_not_exposed() {
        for type_ in [json!("ClusterIP"), json!("ExternalName"), json!(null)] {
            let svc = service(json!({
                "metadata": { "namespace": "web", "name": "internal" },
                "spec": { "type": type_, "ports": [{ "port": 80 }] },
            }));
            assert!(ExposedService::value_from(svc).is_none());
        }
    }

    #[test]
    fn test_node_port_without_status() {
        let svc = service(json!({
            "metadata": { "namespace": "web", "name": "np" },
            "spec": { "type": "NodePort", "ports": [{ "port": 8080, "nodePort": 30080 }] },
        }));
        let exposed = ExposedService::value_from(svc).unwrap();
        assert!(exposed.addresses.is_empty());
        assert!(exposed.source_ranges.is_empty());
        assert_eq!(exposed.ports.len(), 1);
    }
}
