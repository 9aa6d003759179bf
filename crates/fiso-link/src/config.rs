//! YAML config loading and validation for fiso-link (§4.11).

use fiso_core::target::{Protocol, Target};
use serde::Deserialize;

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_metrics() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_prefix() -> String {
    "link".to_string()
}

#[derive(Debug, Deserialize)]
pub struct RawConfig {
    #[serde(default = "default_listen")]
    pub listen_addr: String,
    #[serde(default = "default_metrics")]
    pub metrics_addr: String,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub targets: Vec<Target>,
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub listen_addr: String,
    pub metrics_addr: String,
    pub prefix: String,
    pub targets: Vec<Target>,
}

/// Collects every validation failure instead of stopping at the first one,
/// so a misconfigured file reports everything wrong with it at once.
#[derive(Debug, thiserror::Error)]
#[error("invalid configuration:\n{}", .0.join("\n"))]
pub struct ConfigError(pub Vec<String>);

pub fn load(yaml: &str) -> Result<LinkConfig, ConfigError> {
    let raw: RawConfig = serde_yaml::from_str(yaml).map_err(|e| ConfigError(vec![e.to_string()]))?;
    validate(&raw)?;
    Ok(LinkConfig {
        listen_addr: raw.listen_addr,
        metrics_addr: raw.metrics_addr,
        prefix: raw.prefix,
        targets: raw.targets,
    })
}

fn validate(raw: &RawConfig) -> Result<(), ConfigError> {
    let mut errors = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for target in &raw.targets {
        if target.name.is_empty() {
            errors.push("target name must not be empty".to_string());
        } else if !seen.insert(target.name.clone()) {
            errors.push(format!("duplicate target name: {}", target.name));
        }
        if target.host.is_empty() {
            errors.push(format!("target {}: host must not be empty", target.name));
        }
        if !matches!(
            target.protocol,
            Protocol::Http | Protocol::Https | Protocol::Grpc | Protocol::Kafka
        ) {
            errors.push(format!("target {}: invalid protocol", target.name));
        }
        if !(0.0..=1.0).contains(&target.retry.jitter_fraction) {
            errors.push(format!(
                "target {}: retry.jitter_fraction must be in [0, 1]",
                target.name
            ));
        }
        if let Some(rl) = &target.rate_limit {
            if rl.rate < 0.0 || rl.burst < 0.0 {
                errors.push(format!(
                    "target {}: rate_limit rate and burst must be >= 0",
                    target.name
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applies_defaults_when_absent() {
        let config = load("targets: []\n").unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.prefix, "link");
    }

    #[test]
    fn rejects_duplicate_target_names() {
        let yaml = r#"
targets:
  - name: svc
    protocol: https
    host: example.com
  - name: svc
    protocol: https
    host: example.org
"#;
        let err = load(yaml).unwrap_err();
        assert!(err.0.iter().any(|e| e.contains("duplicate target name")));
    }

    #[test]
    fn rejects_empty_host() {
        let yaml = r#"
targets:
  - name: svc
    protocol: https
    host: ""
"#;
        let err = load(yaml).unwrap_err();
        assert!(err.0.iter().any(|e| e.contains("host must not be empty")));
    }

    #[test]
    fn collects_multiple_errors_together() {
        let yaml = r#"
targets:
  - name: ""
    protocol: https
    host: ""
"#;
        let err = load(yaml).unwrap_err();
        assert!(err.0.len() >= 2);
    }
}
