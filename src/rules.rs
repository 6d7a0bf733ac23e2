use itertools::Itertools;
use std::fmt;
use xxhash_rust::xxh3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// Parses a kubernetes protocol name, defaulting to TCP. SCTP has no counterpart here.
    pub fn from_kube(v: Option<&str>) -> Option<Self> {
        let Some(v) = v else {
            return Some(Self::Tcp);
        };
        match v.to_lowercase().as_str() {
            "tcp" => Some(Self::Tcp),
            "udp" => Some(Self::Udp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub const ALL: Self = Self {
        start: 0,
        end: u16::MAX,
    };

    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Saddr,
    Daddr,
}

impl Field {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Saddr => "saddr",
            Self::Daddr => "daddr",
        }
    }
}

/// `ip <field> [!=] { <set> }`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrMatch {
    pub field: Field,
    pub negated: bool,
    pub set: Vec<String>,
}

impl fmt::Display for AddrMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = if self.negated { "!= " } else { "" };
        write!(
            f,
            "ip {} {op}{{ {} }}",
            self.field.as_str(),
            self.set.iter().join(", ")
        )
    }
}

/// One compiled `accept` statement of the forward chain. It always carries a port clause, so a
/// rule without address matches still only covers its protocol's ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    matches: Vec<AddrMatch>,
    protocol: Protocol,
    ports: Vec<PortRange>,
    comment: String,
}

impl Rule {
    /// None when there is no port to match.
    pub(crate) fn new(
        matches: Vec<AddrMatch>,
        protocol: Protocol,
        ports: Vec<PortRange>,
        comment: String,
    ) -> Option<Self> {
        if ports.is_empty() {
            return None;
        }
        Some(Self {
            matches,
            protocol,
            ports,
            comment,
        })
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for m in &self.matches {
            write!(f, "{m} ")?;
        }
        write!(
            f,
            "{} dport {{ {} }} counter accept comment \"{}\"",
            self.protocol.as_str(),
            self.ports.iter().join(", "),
            self.comment
        )
    }
}

/// Ingress rules followed by egress rules, as produced by one compilation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RuleSet {
    pub ingress: Vec<Rule>,
    pub egress: Vec<Rule>,
}

impl RuleSet {
    pub fn is_empty(&self) -> bool {
        self.ingress.is_empty() && self.egress.is_empty()
    }

    /// xxh3-128 of the rules text, in order.
    pub fn digest(&self) -> u128 {
        let mut text = String::new();
        for (section, rules) in [("ingress", &self.ingress), ("egress", &self.egress)] {
            text.push_str(section);
            text.push('\n');
            for rule in rules {
                text.push_str(&rule.to_string());
                text.push('\n');
            }
        }
        xxh3::xxh3_128(text.as_bytes())
    }
}

/// Whether `candidate` differs from the last activated rules. No previous rules is always a change.
pub fn has_changed(previous: Option<&RuleSet>, candidate: &RuleSet) -> bool {
    let Some(previous) = previous else {
        return true;
    };
    !same_text(&previous.ingress, &candidate.ingress)
        || !same_text(&previous.egress, &candidate.egress)
}

fn same_text(a: &[Rule], b: &[Rule]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(a, b)| a.to_string() == b.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn rule(cidr: &str, proto: Protocol, port: u16) -> Rule {
        Rule::new(
            vec![AddrMatch {
                field: Field::Saddr,
                negated: false,
                set: vec![cidr.into()],
            }],
            proto,
            vec![PortRange::single(port)],
            "test".into(),
        )
        .unwrap()
    }

    #[test]
    fn test_rule_text() {
        let r = Rule::new(
            vec![
                AddrMatch {
                    field: Field::Daddr,
                    negated: true,
                    set: vec!["10.1.0.0/16".into(), "10.2.0.0/16".into()],
                },
                AddrMatch {
                    field: Field::Daddr,
                    negated: false,
                    set: vec!["10.0.0.0/8".into()],
                },
            ],
            Protocol::Udp,
            vec![PortRange::single(53), PortRange { start: 8000, end: 8080 }],
            "np".into(),
        )
        .unwrap();
        assert_eq!(
            r.to_string(),
            "ip daddr != { 10.1.0.0/16, 10.2.0.0/16 } ip daddr { 10.0.0.0/8 } udp dport { 53, 8000-8080 } counter accept comment \"np\""
        );

        let any_source = Rule::new(vec![], Protocol::Tcp, vec![PortRange::ALL], "any".into());
        assert_eq!(
            any_source.unwrap().to_string(),
            "tcp dport { 0-65535 } counter accept comment \"any\""
        );

        // no port clause: no rule
        assert!(Rule::new(vec![], Protocol::Udp, vec![], "none".into()).is_none());
    }

    #[test]
    fn test_protocol_from_kube() {
        assert_eq!(Protocol::from_kube(None), Some(Protocol::Tcp));
        assert_eq!(Protocol::from_kube(Some("TCP")), Some(Protocol::Tcp));
        assert_eq!(Protocol::from_kube(Some("udp")), Some(Protocol::Udp));
        assert_eq!(Protocol::from_kube(Some("SCTP")), None);
    }

    #[test]
    fn test_has_changed() {
        let a = RuleSet {
            ingress: vec![rule("0.0.0.0/0", Protocol::Tcp, 443)],
            egress: vec![],
        };

        assert!(has_changed(None, &a));
        assert!(has_changed(None, &RuleSet::default()));
        assert!(!has_changed(Some(&a), &a.clone()));

        let mut port = a.clone();
        port.ingress[0] = rule("0.0.0.0/0", Protocol::Tcp, 80);
        assert!(has_changed(Some(&a), &port));

        let mut proto = a.clone();
        proto.ingress[0] = rule("0.0.0.0/0", Protocol::Udp, 443);
        assert!(has_changed(Some(&a), &proto));

        // same rule moved to egress
        let moved = RuleSet {
            ingress: vec![],
            egress: a.ingress.clone(),
        };
        assert!(has_changed(Some(&a), &moved));

        let mut longer = a.clone();
        longer.ingress.push(rule("10.0.0.0/8", Protocol::Tcp, 22));
        assert!(has_changed(Some(&a), &longer));
        assert!(has_changed(Some(&longer), &a));
    }

    #[test]
    fn test_digest() {
        let a = RuleSet {
            ingress: vec![rule("0.0.0.0/0", Protocol::Tcp, 443)],
            egress: vec![],
        };
        let moved = RuleSet {
            ingress: vec![],
            egress: a.ingress.clone(),
        };
        assert_eq!(a.digest(), a.clone().digest());
        assert_ne!(a.digest(), moved.digest());
    }
}
