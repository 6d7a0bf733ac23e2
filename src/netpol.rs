use crate::snapshot::{KeyValueFrom, keys};

use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyEgressRule as EgressRule, NetworkPolicyIngressRule as IngressRule,
};
use log::debug;

/// A NetworkPolicy reduced to what the firewall compiles: the active directions and their rules.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub is_ingress: bool,
    pub is_egress: bool,
    pub ingress: Vec<IngressRule>,
    pub egress: Vec<EgressRule>,
}

impl KeyValueFrom<NetworkPolicy> for Policy {
    type Key = keys::Object;

    fn key_from(v: &NetworkPolicy) -> Option<Self::Key> {
        keys::Object::try_from(&v.metadata).ok()
    }

    fn value_from(v: NetworkPolicy) -> Option<Self> {
        let spec = v.spec?;
        let (is_ingress, is_egress) =
            directions(spec.policy_types.as_deref(), spec.egress.is_some());
        Some(Self {
            is_ingress,
            is_egress,
            ingress: spec.ingress.unwrap_or_default(),
            egress: spec.egress.unwrap_or_default(),
        })
    }
}

/// Effective (ingress, egress) directions of a policy.
fn directions(policy_types: Option<&[String]>, has_egress: bool) -> (bool, bool) {
    let Some(policy_types) = policy_types else {
        // (ref) all policies are assumed to affect ingress, and egress if they have an egress section
        return (true, has_egress);
    };

    let (mut ingress, mut egress) = (false, false);
    for policy_type in policy_types {
        match policy_type.to_lowercase().as_str() {
            "ingress" => ingress = true,
            "egress" => egress = true,
            "both" => {
                ingress = true;
                egress = true;
            }
            _ => debug!("ignoring unknown policy type {policy_type:?}"),
        }
    }
    (ingress, egress)
}
