//! Translation of the cluster's network intent into forward-chain rules.
//!
//! Compilation never fails: whatever can't be expressed as an IPv4 nftables match is logged and
//! left out. Leaving something out never widens a rule; a rule that loses all of its peers or all
//! of its ports is dropped as a whole. A rule without ports covers the full TCP and UDP ranges,
//! never other protocols.

use cidr::{IpCidr, Ipv4Cidr};
use k8s_openapi::api::networking::v1::{NetworkPolicyPeer, NetworkPolicyPort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use log::{debug, info, warn};
use std::collections::BTreeSet as Set;
use std::net::IpAddr;

use crate::rules::{AddrMatch, Field, PortRange, Protocol, Rule, RuleSet};
use crate::service::{self, ExposedService};
use crate::snapshot::{Snapshot, keys};


/// Source match of services without `loadBalancerSourceRanges`.
const ANY_SOURCE: &str = "0.0.0.0/0";

/// Compiles the snapshot into ingress rules (policies, then services) and egress rules.
pub fn compile(snapshot: &Snapshot) -> RuleSet {
    let mut ingress = Vec::new();
    let mut egress = Vec::new();

    for (key, policy) in &snapshot.policies {
        let comment = format!("accept traffic for k8s network policy {}", key.name);

        if policy.is_ingress {
            for rule in &policy.ingress {
                let peers = Peers::from_kube(key, rule.from.as_deref());
                let ports = PortSets::from_policy(key, rule.ports.as_deref());
                push_rules(&mut ingress, peers.matches(Field::Saddr), &ports, &comment);
            }
        }

        if policy.is_egress {
            for rule in &policy.egress {
                let peers = Peers::from_kube(key, rule.to.as_deref());
                let ports = PortSets::from_policy(key, rule.ports.as_deref());
                push_rules(&mut egress, peers.matches(Field::Daddr), &ports, &comment);
            }
        }
    }

    for (key, svc) in &snapshot.services {
        service_rules(&mut ingress, key, svc);
    }

    RuleSet { ingress, egress }
}

fn service_rules(rules: &mut Vec<Rule>, key: &keys::Object, svc: &ExposedService) {
    let comment = format!("accept traffic for k8s service {key}");

    let sources = if svc.source_ranges.is_empty() {
        vec![ANY_SOURCE.to_string()]
    } else {
        let mut sources = Vec::with_capacity(svc.source_ranges.len());
        for s in &svc.source_ranges {
            if let Some(cidr) = parse_cidr(key, s) {
                push_unique(&mut sources, cidr_str(&cidr));
            }
        }
        if sources.is_empty() {
            warn!("{key}: no usable source range, service ignored");
            return;
        }
        sources
    };

    let mut addresses = Vec::with_capacity(svc.addresses.len());
    for addr in &svc.addresses {
        match addr.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => push_unique(&mut addresses, ip.to_string()),
            Ok(IpAddr::V6(_)) => debug!("{key}: IPv6 address ignored: {addr}"),
            Err(e) => warn!("{key}: invalid address (ignored): {addr}: {e}"),
        }
    }
    // NodePort services without a load-balancer address have no destination to match
    if addresses.is_empty() {
        info!("{key}: no load-balancer address, service ignored");
        return;
    }

    let matches = vec![
        AddrMatch {
            field: Field::Saddr,
            negated: false,
            set: sources,
        },
        AddrMatch {
            field: Field::Daddr,
            negated: false,
            set: addresses,
        },
    ];

    let mut ports = PortSets::default();
    for service::Port { protocol, port } in &svc.ports {
        let Some(proto) = protocol_of(key, protocol.as_deref()) else {
            continue;
        };
        let Some(port) = port_number(key, *port) else {
            continue;
        };
        ports.insert(proto, PortRange::single(port));
    }

    push_rules(rules, Some(matches), &ports, &comment);
}

/// Emits at most one rule per protocol, all sharing the same address matches.
fn push_rules(
    rules: &mut Vec<Rule>,
    matches: Option<Vec<AddrMatch>>,
    ports: &PortSets,
    comment: &str,
) {
    let Some(matches) = matches else {
        return;
    };

    for (proto, set) in [(Protocol::Tcp, &ports.tcp), (Protocol::Udp, &ports.udp)] {
        let ranges = set.iter().copied().collect();
        if let Some(rule) = Rule::new(matches.clone(), proto, ranges, comment.to_string()) {
            rules.push(rule);
        }
    }
}

enum Peers {
    /// No peer declared: any address.
    Any,
    Blocks {
        allow: Vec<Ipv4Cidr>,
        except: Vec<Ipv4Cidr>,
    },
    /// Peers were declared but none of them can be expressed.
    Unusable,
}

impl Peers {
    fn from_kube(key: &keys::Object, peers: Option<&[NetworkPolicyPeer]>) -> Self {
        let Some(peers) = peers.filter(|peers| !peers.is_empty()) else {
            return Self::Any;
        };

        let mut allow = Vec::new();
        let mut except = Vec::new();

        for peer in peers {
            let Some(ref ip_block) = peer.ip_block else {
                debug!("{key}: only ipBlock peers are supported (peer ignored)");
                continue;
            };

            let Some(cidr) = parse_cidr(key, &ip_block.cidr) else {
                continue;
            };

            let block_except: Option<Vec<_>> = (ip_block.except.iter().flatten())
                .map(|s| {
                    parse_cidr(key, s).or_else(|| {
                        warn!("{key}: unusable except, block {} ignored", ip_block.cidr);
                        None
                    })
                })
                .collect();
            let Some(block_except) = block_except else {
                continue;
            };

            push_unique(&mut allow, cidr);
            for e in block_except {
                push_unique(&mut except, e);
            }
        }

        if allow.is_empty() {
            warn!("{key}: no usable peer in rule, rule ignored");
            return Self::Unusable;
        }

        Self::Blocks { allow, except }
    }

    /// Exclusions come first so they're evaluated before the allow set.
    fn matches(&self, field: Field) -> Option<Vec<AddrMatch>> {
        match self {
            Self::Any => Some(vec![]),
            Self::Unusable => None,
            Self::Blocks { allow, except } => {
                let mut matches = Vec::with_capacity(2);
                if !except.is_empty() {
                    matches.push(AddrMatch {
                        field,
                        negated: true,
                        set: except.iter().map(cidr_str).collect(),
                    });
                }
                matches.push(AddrMatch {
                    field,
                    negated: false,
                    set: allow.iter().map(cidr_str).collect(),
                });
                Some(matches)
            }
        }
    }
}

#[derive(Default)]
struct PortSets {
    tcp: Set<PortRange>,
    udp: Set<PortRange>,
}

impl PortSets {
    fn insert(&mut self, proto: Protocol, range: PortRange) {
        match proto {
            Protocol::Tcp => self.tcp.insert(range),
            Protocol::Udp => self.udp.insert(range),
        };
    }

    /// Ports of a policy rule. None declared means every port of both protocols.
    fn from_policy(key: &keys::Object, ports: Option<&[NetworkPolicyPort]>) -> Self {
        let mut sets = Self::default();

        let Some(ports) = ports.filter(|ports| !ports.is_empty()) else {
            sets.insert(Protocol::Tcp, PortRange::ALL);
            sets.insert(Protocol::Udp, PortRange::ALL);
            return sets;
        };

        for port in ports {
            let Some(proto) = protocol_of(key, port.protocol.as_deref()) else {
                continue;
            };

            let range = match (port.port.as_ref(), port.end_port) {
                (None, _) => PortRange::ALL,
                (Some(IntOrString::String(name)), _) => {
                    warn!("{key}: named ports are not supported (port {name} ignored)");
                    continue;
                }
                (Some(IntOrString::Int(port)), None) => {
                    let Some(port) = port_number(key, *port) else {
                        continue;
                    };
                    PortRange::single(port)
                }
                (Some(IntOrString::Int(start)), Some(end)) => {
                    let (Some(start), Some(end)) = (port_number(key, *start), port_number(key, end))
                    else {
                        continue;
                    };
                    if end < start {
                        warn!("{key}: invalid port range {start}-{end} (ignored)");
                        continue;
                    }
                    PortRange { start, end }
                }
            };

            sets.insert(proto, range);
        }

        sets
    }
}

fn protocol_of(key: &keys::Object, protocol: Option<&str>) -> Option<Protocol> {
    let proto = Protocol::from_kube(protocol);
    if proto.is_none() {
        warn!("{key}: unsupported protocol {protocol:?} (port ignored)");
    }
    proto
}

fn port_number(key: &keys::Object, port: i32) -> Option<u16> {
    u16::try_from(port)
        .inspect_err(|_| warn!("{key}: invalid port {port} (ignored)"))
        .ok()
}

fn parse_cidr(key: &keys::Object, s: &str) -> Option<Ipv4Cidr> {
    match s.parse::<IpCidr>() {
        Ok(IpCidr::V4(cidr)) => Some(cidr),
        Ok(IpCidr::V6(_)) => {
            debug!("{key}: IPv6 block ignored: {s}");
            None
        }
        Err(e) => {
            warn!("{key}: invalid ip block (ignored): {s}: {e}");
            None
        }
    }
}

/// Always in `address/length` form, host networks included.
fn cidr_str(cidr: &Ipv4Cidr) -> String {
    format!("{}/{}", cidr.first_address(), cidr.network_length())
}

fn push_unique<T: PartialEq>(v: &mut Vec<T>, item: T) {
    if !v.contains(&item) {
        v.push(item);
    }
}
