use std::fmt::Write;

use crate::rules::{Rule, RuleSet};

/// Baseline of the filter table up to the dynamic part of the forward chain.
const FILTER_HEAD: &str = r#"table ip filter {
	chain input {
		type filter hook input priority 0; policy drop;
		jump ct-icmp

		iif lo counter accept comment "BGP unnumbered"
		iif lan0 ip saddr 10.0.0.0/8 udp dport 4789 counter accept comment "incoming vxlan lan0"
		iif lan1 ip saddr 10.0.0.0/8 udp dport 4789 counter accept comment "incoming vxlan lan1"
		ct state new tcp dport 22 counter accept comment "incoming ssh"

		goto refuse
	}
	chain forward {
		type filter hook forward priority 0; policy drop;
		jump ct-icmp
"#;

const FILTER_TAIL: &str = r#"
		goto refuse
	}
	chain output {
		type filter hook output priority 0; policy drop;
		jump ct-icmp

		iif lo counter accept comment "accept output required e.g. for chrony"

		goto refuse
	}
	chain ct-icmp {
		# state dependent rules
		ct state established,related counter accept comment "accept established connections"
		ct state invalid counter drop comment "drop packets with invalid ct state"

		# no ping floods
		ip protocol icmp icmp type echo-request limit rate over 10/second burst 4 packets counter drop comment "drop ping floods"

		# ICMP
		ip protocol icmp icmp type { destination-unreachable, router-solicitation, router-advertisement, time-exceeded, parameter-problem } counter accept comment "accept icmp"
	}
	chain refuse {
		counter comment "count dropped packets"
		limit rate 2/minute counter packets 1 bytes 40 log prefix "nftables-dropped: "
	}
}
"#;

const NAT: &str = r#"table ip nat {
	chain postrouting {
		type nat hook postrouting priority 0; policy accept;
	}
}
"#;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{section} rule {index}: {reason}: {rule}")]
    InvalidRule {
        section: &'static str,
        index: usize,
        reason: &'static str,
        rule: String,
    },
    #[error("write failed: {0}")]
    Write(#[from] std::fmt::Error),
}

/// Renders the full nftables document, with the rules spliced into the forward chain.
pub fn render(rules: &RuleSet) -> Result<String, Error> {
    let mut doc = String::new();

    writeln!(doc, "# generated by knfw, do not edit")?;
    writeln!(doc, "# ruleset xxh3:{:032x}", rules.digest())?;

    // replace the whole table atomically: declare it so the delete can't fail
    writeln!(doc, "table ip filter {{}}")?;
    writeln!(doc, "delete table ip filter")?;

    doc.push_str(FILTER_HEAD);

    writeln!(doc, "\n\t\t# dynamic ingress rules")?;
    write_rules(&mut doc, "ingress", &rules.ingress)?;

    writeln!(doc, "\n\t\t# dynamic egress rules")?;
    write_rules(&mut doc, "egress", &rules.egress)?;

    doc.push_str(FILTER_TAIL);
    doc.push_str(NAT);

    Ok(doc)
}

fn write_rules(doc: &mut String, section: &'static str, rules: &[Rule]) -> Result<(), Error> {
    for (index, rule) in rules.iter().enumerate() {
        let rule = rule.to_string();
        if let Err(reason) = check_line(&rule) {
            return Err(Error::InvalidRule {
                section,
                index,
                reason,
                rule,
            });
        }
        writeln!(doc, "\t\t{rule}")?;
    }
    Ok(())
}

/// A rule must stay a single, self-contained statement of the chain.
fn check_line(rule: &str) -> Result<(), &'static str> {
    if rule.trim().is_empty() {
        return Err("empty rule");
    }
    if rule.contains(['\n', '\r']) {
        return Err("line break in rule");
    }
    if rule.matches('"').count() % 2 != 0 {
        return Err("unbalanced quotes");
    }

    let mut depth = 0usize;
    let mut quoted = false;
    for c in rule.chars() {
        match c {
            '"' => quoted = !quoted,
            '{' if !quoted => depth += 1,
            '}' if !quoted => {
                depth = depth.checked_sub(1).ok_or("unbalanced braces")?;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err("unbalanced braces");
    }

    Ok(())
}
