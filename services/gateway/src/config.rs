use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;

// Gateway service configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    // Plain WebSocket listener bind address.
    pub ws_bind: SocketAddr,
    // Whether the TLS listener is enabled.
    pub tls_enabled: bool,
    // TLS WebSocket listener bind address.
    pub ws_tls_bind: SocketAddr,
    // PEM certificate chain path, required when TLS is enabled.
    pub tls_cert_path: Option<String>,
    // PEM private key path, required when TLS is enabled.
    pub tls_key_path: Option<String>,
    // Cluster name reported to the broker side; not part of framing.
    pub cluster_name: String,
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // External broker address; the in-process broker is used when unset.
    pub broker_addr: Option<SocketAddr>,
    // Bound depth of per-session delivery queues.
    pub session_queue_depth: usize,
    // Max WebSocket message / broker frame size.
    pub max_frame_bytes: usize,
    // Max time a single publish may hold a producer session.
    pub publish_timeout_ms: u64,
    // Max time for TLS + WebSocket handshakes per connection.
    pub handshake_timeout_ms: u64,
    // Max time stop() waits for live sessions to drain.
    pub shutdown_timeout_ms: u64,
}

const DEFAULT_SESSION_QUEUE_DEPTH: usize = 64;
const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;
const DEFAULT_PUBLISH_TIMEOUT_MS: u64 = 2000;
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Deserialize)]
struct GatewayConfigOverride {
    ws_bind: Option<String>,
    tls_enabled: Option<bool>,
    ws_tls_bind: Option<String>,
    tls_cert_path: Option<String>,
    tls_key_path: Option<String>,
    cluster_name: Option<String>,
    metrics_bind: Option<String>,
    broker_addr: Option<String>,
    session_queue_depth: Option<usize>,
    max_frame_bytes: Option<usize>,
    publish_timeout_ms: Option<u64>,
    handshake_timeout_ms: Option<u64>,
    shutdown_timeout_ms: Option<u64>,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        // Environment variables provide defaults for local development.
        let ws_bind = std::env::var("WSGATE_WS_BIND")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .with_context(|| "parse WSGATE_WS_BIND")?;
        let tls_enabled = std::env::var("WSGATE_TLS_ENABLED")
            .ok()
            .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        let ws_tls_bind = std::env::var("WSGATE_WS_TLS_BIND")
            .unwrap_or_else(|_| "0.0.0.0:8443".to_string())
            .parse()
            .with_context(|| "parse WSGATE_WS_TLS_BIND")?;
        let tls_cert_path = std::env::var("WSGATE_TLS_CERT_PATH").ok();
        let tls_key_path = std::env::var("WSGATE_TLS_KEY_PATH").ok();
        let cluster_name =
            std::env::var("WSGATE_CLUSTER_NAME").unwrap_or_else(|_| "standalone".to_string());
        let metrics_bind = std::env::var("WSGATE_METRICS_BIND")
            .unwrap_or_else(|_| "0.0.0.0:9090".to_string())
            .parse()
            .with_context(|| "parse WSGATE_METRICS_BIND")?;
        let broker_addr = match std::env::var("WSGATE_BROKER_ADDR") {
            Ok(value) => Some(value.parse().with_context(|| "parse WSGATE_BROKER_ADDR")?),
            Err(_) => None,
        };
        let session_queue_depth = std::env::var("WSGATE_SESSION_QUEUE_DEPTH")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_SESSION_QUEUE_DEPTH);
        let max_frame_bytes = std::env::var("WSGATE_MAX_FRAME_BYTES")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_FRAME_BYTES);
        let publish_timeout_ms = std::env::var("WSGATE_PUBLISH_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_PUBLISH_TIMEOUT_MS);
        let handshake_timeout_ms = std::env::var("WSGATE_HANDSHAKE_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_MS);
        let shutdown_timeout_ms = std::env::var("WSGATE_SHUTDOWN_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_MS);
        Ok(Self {
            ws_bind,
            tls_enabled,
            ws_tls_bind,
            tls_cert_path,
            tls_key_path,
            cluster_name,
            metrics_bind,
            broker_addr,
            session_queue_depth,
            max_frame_bytes,
            publish_timeout_ms,
            handshake_timeout_ms,
            shutdown_timeout_ms,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("WSGATE_GATEWAY_CONFIG") {
            // YAML overrides allow ops-friendly config files.
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read WSGATE_GATEWAY_CONFIG: {path}"))?;
            let override_cfg: GatewayConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse gateway config yaml")?;
            if let Some(value) = override_cfg.ws_bind {
                config.ws_bind = value.parse().with_context(|| "parse ws_bind")?;
            }
            if let Some(value) = override_cfg.tls_enabled {
                config.tls_enabled = value;
            }
            if let Some(value) = override_cfg.ws_tls_bind {
                config.ws_tls_bind = value.parse().with_context(|| "parse ws_tls_bind")?;
            }
            if let Some(value) = override_cfg.tls_cert_path {
                config.tls_cert_path = Some(value);
            }
            if let Some(value) = override_cfg.tls_key_path {
                config.tls_key_path = Some(value);
            }
            if let Some(value) = override_cfg.cluster_name {
                config.cluster_name = value;
            }
            if let Some(value) = override_cfg.metrics_bind {
                config.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
            }
            if let Some(value) = override_cfg.broker_addr {
                config.broker_addr = Some(value.parse().with_context(|| "parse broker_addr")?);
            }
            if let Some(value) = override_cfg.session_queue_depth
                && value > 0
            {
                config.session_queue_depth = value;
            }
            if let Some(value) = override_cfg.max_frame_bytes
                && value > 0
            {
                config.max_frame_bytes = value;
            }
            if let Some(value) = override_cfg.publish_timeout_ms {
                config.publish_timeout_ms = value;
            }
            if let Some(value) = override_cfg.handshake_timeout_ms {
                config.handshake_timeout_ms = value;
            }
            if let Some(value) = override_cfg.shutdown_timeout_ms {
                config.shutdown_timeout_ms = value;
            }
        }
        config.validate()?;
        Ok(config)
    }

    // TLS material is checked again (and loaded) at listener startup; this
    // catches the inconsistent flag combination as early as possible.
    pub fn validate(&self) -> Result<()> {
        if self.tls_enabled {
            if self.tls_cert_path.is_none() {
                bail!("WSGATE_TLS_ENABLED is set but WSGATE_TLS_CERT_PATH is missing");
            }
            if self.tls_key_path.is_none() {
                bail!("WSGATE_TLS_ENABLED is set but WSGATE_TLS_KEY_PATH is missing");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    struct EnvGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::set_var(key, value);
            }
            Self { key, prev }
        }

        fn unset(key: &'static str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::remove_var(key);
            }
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.prev {
                Some(value) => unsafe {
                    std::env::set_var(self.key, value);
                },
                None => unsafe {
                    std::env::remove_var(self.key);
                },
            }
        }
    }

    fn clear_env() -> Vec<EnvGuard> {
        vec![
            EnvGuard::unset("WSGATE_WS_BIND"),
            EnvGuard::unset("WSGATE_TLS_ENABLED"),
            EnvGuard::unset("WSGATE_WS_TLS_BIND"),
            EnvGuard::unset("WSGATE_TLS_CERT_PATH"),
            EnvGuard::unset("WSGATE_TLS_KEY_PATH"),
            EnvGuard::unset("WSGATE_CLUSTER_NAME"),
            EnvGuard::unset("WSGATE_METRICS_BIND"),
            EnvGuard::unset("WSGATE_BROKER_ADDR"),
            EnvGuard::unset("WSGATE_SESSION_QUEUE_DEPTH"),
            EnvGuard::unset("WSGATE_MAX_FRAME_BYTES"),
            EnvGuard::unset("WSGATE_PUBLISH_TIMEOUT_MS"),
            EnvGuard::unset("WSGATE_HANDSHAKE_TIMEOUT_MS"),
            EnvGuard::unset("WSGATE_SHUTDOWN_TIMEOUT_MS"),
            EnvGuard::unset("WSGATE_GATEWAY_CONFIG"),
        ]
    }

    #[test]
    #[serial]
    fn defaults_without_env() -> Result<()> {
        let _guards = clear_env();
        let config = GatewayConfig::from_env_or_yaml()?;
        assert_eq!(config.ws_bind, "0.0.0.0:8080".parse().unwrap());
        assert!(!config.tls_enabled);
        assert_eq!(config.cluster_name, "standalone");
        assert_eq!(config.broker_addr, None);
        assert_eq!(config.session_queue_depth, DEFAULT_SESSION_QUEUE_DEPTH);
        assert_eq!(config.max_frame_bytes, DEFAULT_MAX_FRAME_BYTES);
        Ok(())
    }

    #[test]
    #[serial]
    fn env_overrides_apply() -> Result<()> {
        let _guards = clear_env();
        let _g1 = EnvGuard::set("WSGATE_WS_BIND", "127.0.0.1:7070");
        let _g2 = EnvGuard::set("WSGATE_CLUSTER_NAME", "use");
        let _g3 = EnvGuard::set("WSGATE_BROKER_ADDR", "127.0.0.1:5000");
        let _g4 = EnvGuard::set("WSGATE_SESSION_QUEUE_DEPTH", "8");

        let config = GatewayConfig::from_env_or_yaml()?;
        assert_eq!(config.ws_bind, "127.0.0.1:7070".parse().unwrap());
        assert_eq!(config.cluster_name, "use");
        assert_eq!(config.broker_addr, Some("127.0.0.1:5000".parse().unwrap()));
        assert_eq!(config.session_queue_depth, 8);
        Ok(())
    }

    #[test]
    #[serial]
    fn yaml_overrides_env() -> Result<()> {
        let _guards = clear_env();
        let _g1 = EnvGuard::set("WSGATE_WS_BIND", "127.0.0.1:7070");

        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "ws_bind: \"127.0.0.1:7071\"")?;
        writeln!(file, "cluster_name: from-yaml")?;
        writeln!(file, "publish_timeout_ms: 123")?;
        let path = file.path().to_string_lossy().to_string();
        let _g2 = EnvGuard::set("WSGATE_GATEWAY_CONFIG", &path);

        let config = GatewayConfig::from_env_or_yaml()?;
        assert_eq!(config.ws_bind, "127.0.0.1:7071".parse().unwrap());
        assert_eq!(config.cluster_name, "from-yaml");
        assert_eq!(config.publish_timeout_ms, 123);
        Ok(())
    }

    #[test]
    #[serial]
    fn tls_enabled_without_material_is_an_error() {
        let _guards = clear_env();
        let _g1 = EnvGuard::set("WSGATE_TLS_ENABLED", "true");
        let err = GatewayConfig::from_env_or_yaml().expect_err("missing cert");
        assert!(err.to_string().contains("WSGATE_TLS_CERT_PATH"));
    }

    #[test]
    #[serial]
    fn invalid_bind_address_is_an_error() {
        let _guards = clear_env();
        let _g1 = EnvGuard::set("WSGATE_WS_BIND", "not-an-addr");
        assert!(GatewayConfig::from_env().is_err());
    }
}
