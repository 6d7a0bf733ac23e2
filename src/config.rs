use eyre::{Result, format_err};
use std::time::Duration;

#[derive(Debug, serde::Deserialize, serde::Serialize)]
pub struct Config {
    /// Namespace to watch instead of the whole cluster.
    pub namespace: Option<String>,

    /// Kubernetes API server URL
    pub cluster_url: Option<String>,

    /// Change signals buffer size
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Quiet period after a change before the rules are recompiled
    #[serde(default = "default_debounce", with = "duration")]
    pub debounce: Duration,

    /// Recompile period, even without changes
    #[serde(default = "default_fetch_interval", with = "duration")]
    pub fetch_interval: Duration,

    /// Delay before watching again after a watch failure
    #[serde(default = "default_watch_backoff", with = "duration")]
    pub watch_backoff: Duration,

    /// Rules activation on the host
    #[serde(default)]
    pub apply: knfw::apply::Config,
}
fn default_event_buffer() -> usize {
    100
}
fn default_debounce() -> Duration {
    Duration::from_secs(3)
}
fn default_fetch_interval() -> Duration {
    Duration::from_secs(10)
}
fn default_watch_backoff() -> Duration {
    Duration::from_secs(10)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: None,
            cluster_url: None,
            event_buffer: default_event_buffer(),
            debounce: default_debounce(),
            fetch_interval: default_fetch_interval(),
            watch_backoff: default_watch_backoff(),
            apply: Default::default(),
        }
    }
}

impl Config {
    /// parse the cluster_url
    pub fn cluster_url(&self) -> Result<Option<http::Uri>> {
        match self.cluster_url {
            None => Ok(None),
            Some(ref v) => Ok(Some(v.parse()?)),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.event_buffer == 0 {
            return Err(format_err!("event_buffer must be positive"));
        }
        if self.fetch_interval.is_zero() {
            return Err(format_err!("fetch_interval must be positive"));
        }
        for (name, value) in [
            ("debounce", self.debounce),
            ("fetch_interval", self.fetch_interval),
            ("watch_backoff", self.watch_backoff),
        ] {
            if value > MAX_DELAY {
                return Err(format_err!("{name} must not exceed {MAX_DELAY:?}"));
            }
        }
        Ok(())
    }
}

/// Upper bound of the configured delays.
pub const MAX_DELAY: Duration = Duration::from_secs(24 * 3600);

/// Parses `500ms`, `10s`, `2m`, `1h` or a plain number of seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (value, unit) = s.split_at(split);

    let value: u64 = value
        .parse()
        .map_err(|e| format_err!("invalid duration {s:?}: {e}"))?;

    let secs = |factor: u64| {
        value
            .checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(|| format_err!("duration out of range: {s:?}"))
    };

    match unit.trim() {
        "ms" => Ok(Duration::from_millis(value)),
        "" | "s" => secs(1),
        "m" => secs(60),
        "h" => secs(3600),
        unit => Err(format_err!("invalid duration unit {unit:?} in {s:?}")),
    }
}

mod duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Value {
            Secs(u64),
            Text(String),
        }
        match Value::deserialize(d)? {
            Value::Secs(v) => Ok(Duration::from_secs(v)),
            Value::Text(s) => super::parse_duration(&s).map_err(serde::de::Error::custom),
        }
    }

    pub fn serialize<S: Serializer>(v: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{}ms", v.as_millis()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("ten").is_err());
        assert!(parse_duration("10d").is_err());

        // overflows are errors, not wrapped values
        assert!(parse_duration("18446744073709551615h").is_err());
        assert!(parse_duration("18446744073709551615m").is_err());
        assert!(parse_duration("99999999999999999999").is_err());
        assert_eq!(
            parse_duration("18446744073709551615").unwrap(),
            Duration::from_secs(u64::MAX)
        );
    }

    #[test]
    fn test_config() {
        let cfg: Config = serde_yaml::from_str(
            r#"
namespace: firewall
debounce: 500ms
fetch_interval: 30
apply:
  path: /tmp/rules.v4
"#,
        )
        .unwrap();

        assert_eq!(cfg.namespace.as_deref(), Some("firewall"));
        assert_eq!(cfg.debounce, Duration::from_millis(500));
        assert_eq!(cfg.fetch_interval, Duration::from_secs(30));
        assert_eq!(cfg.watch_backoff, Duration::from_secs(10));
        assert_eq!(cfg.event_buffer, 100);
        assert_eq!(cfg.apply.path.to_str(), Some("/tmp/rules.v4"));
        assert_eq!(cfg.apply.check.cmd, "/usr/sbin/nft");
        cfg.validate().unwrap();
    }

    #[test]
    fn test_invalid_config() {
        let cfg: Config = serde_yaml::from_str("fetch_interval: 0s").unwrap();
        assert!(cfg.validate().is_err());

        for yaml in [
            "debounce: 18446744073709551615",
            "fetch_interval: 18446744073709551615s",
            "watch_backoff: 25h",
        ] {
            let cfg: Config = serde_yaml::from_str(yaml).unwrap();
            assert!(cfg.validate().is_err(), "{yaml}");
        }

        let cfg: Config = serde_yaml::from_str("fetch_interval: 24h").unwrap();
        cfg.validate().unwrap();

        let cfg: Config = serde_yaml::from_str("cluster_url: 'not a url'").unwrap();
        assert!(cfg.cluster_url().is_err());
    }
}
