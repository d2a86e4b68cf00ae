//! Node Configuration
//!
//! A JSON file (optional) supplies the base `NodeConfig`; command-line flags
//! override individual fields.

use anyhow::{Context, Result};
use leo_consensus::NodeConfig;
use std::net::SocketAddr;
use std::path::Path;

/// Command-line overrides, `None` leaves the file/default value
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub node_id: Option<String>,
    pub listen_addr: Option<SocketAddr>,
    pub dimension: Option<usize>,
    pub rho: Option<f64>,
    pub alpha: Option<f64>,
    pub tau: Option<f64>,
    pub delta_c: Option<f64>,
    pub delta_n: Option<f64>,
    pub round_timeout_ms: Option<u64>,
    pub max_iterations: Option<usize>,
    pub epsilon: Option<f64>,
}

/// Read the config file if given, else start from defaults
pub fn load(path: Option<&Path>) -> Result<NodeConfig> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parsing config file {}", path.display()))
        }
        None => Ok(NodeConfig::default()),
    }
}

/// Apply overrides and validate the result
pub fn resolve(mut config: NodeConfig, overrides: Overrides) -> Result<NodeConfig> {
    macro_rules! apply {
        ($($field:ident),*) => {
            $(if let Some(value) = overrides.$field {
                config.$field = value;
            })*
        };
    }
    apply!(
        node_id,
        listen_addr,
        dimension,
        rho,
        alpha,
        tau,
        delta_c,
        delta_n,
        round_timeout_ms,
        max_iterations,
        epsilon
    );

    config.validate()?;
    Ok(config)
}

/// Split `host:port`, accepting bracketed IPv6 hosts
pub fn parse_peer(spec: &str) -> Result<(String, u16)> {
    let (host, port) = spec
        .rsplit_once(':')
        .with_context(|| format!("peer {:?} is not host:port", spec))?;
    let port = port
        .parse()
        .with_context(|| format!("invalid port in peer {:?}", spec))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_defaults_without_file() {
        let config = load(None).unwrap();
        assert_eq!(config.dimension, 128);
        assert_eq!(config.tau, 0.8);
    }

    #[test]
    fn test_file_then_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"node_id": "from-file", "dimension": 8, "alpha": 0.5}}"#).unwrap();

        let base = load(Some(file.path())).unwrap();
        assert_eq!(base.node_id, "from-file");
        assert_eq!(base.dimension, 8);

        let config = resolve(
            base,
            Overrides {
                alpha: Some(0.9),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(config.alpha, 0.9);
        assert_eq!(config.dimension, 8);
        assert_eq!(config.node_id, "from-file");
    }

    #[test]
    fn test_invalid_override_rejected() {
        let result = resolve(
            NodeConfig::default(),
            Overrides {
                rho: Some(-1.0),
                ..Default::default()
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_bad_file_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let err = load(Some(file.path())).unwrap_err();
        assert!(format!("{:#}", err).contains("parsing config file"));
    }

    #[test]
    fn test_parse_peer() {
        assert_eq!(parse_peer("127.0.0.1:5001").unwrap(), ("127.0.0.1".to_string(), 5001));
        assert_eq!(parse_peer("[::1]:5001").unwrap(), ("::1".to_string(), 5001));
        assert_eq!(parse_peer("localhost:80").unwrap(), ("localhost".to_string(), 80));
        assert!(parse_peer("no-port").is_err());
        assert!(parse_peer("host:notaport").is_err());
    }
}
