//! Connector configuration

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::socket::Socket;

/// Top-level connector configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    pub connector: ConnectorSettings,

    /// Statically configured sockets, served by the static discovery plugin
    pub sockets: Vec<StaticSocketConfig>,

    /// Cloud instance groups, served by the cloud-tag discovery plugin
    pub cloud_groups: Vec<CloudGroupConfig>,

    /// Optional HTTP(S) CONNECT proxy for the tunnel transport
    pub proxy: Option<String>,

    /// Keep the server-side `upstream_type` untouched when updating a socket.
    /// The default mirrors the control plane's historical behavior of
    /// clearing it so the server re-infers the value.
    pub preserve_upstream_type: bool,
}

/// Identity of this connector instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorSettings {
    pub name: String,
}

/// A socket declared directly in the configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticSocketConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub socket_type: String,
    pub upstream_username: String,
    pub upstream_password: String,
    pub upstream_type: String,
    pub upstream_http_hostname: String,
    pub allowed_email_addresses: Vec<String>,
    pub allowed_email_domains: Vec<String>,
    pub policies: Vec<String>,
    pub connector_auth: bool,
}

impl StaticSocketConfig {
    /// Materialize this entry as a desired socket. Cloud authentication is
    /// always on for connector-managed sockets.
    pub fn to_socket(&self) -> Socket {
        Socket {
            name: self.name.clone(),
            socket_type: self.socket_type.clone(),
            target_hostname: self.host.clone(),
            target_port: self.port,
            upstream_username: self.upstream_username.clone(),
            upstream_password: self.upstream_password.clone(),
            upstream_type: self.upstream_type.clone(),
            upstream_http_hostname: self.upstream_http_hostname.clone(),
            allowed_email_addresses: self.allowed_email_addresses.clone(),
            allowed_email_domains: self.allowed_email_domains.clone(),
            policy_names: self.policies.clone(),
            connector_auth_enabled: self.connector_auth,
            cloud_auth_enabled: true,
            ..Default::default()
        }
    }
}

/// A group of cloud instances to expose, matched by the `group` label in
/// their `border0`-prefixed tags
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudGroupConfig {
    pub group: String,
    pub allowed_email_addresses: Vec<String>,
    pub allowed_email_domains: Vec<String>,
    pub policies: Vec<String>,
    pub connector_auth: bool,
}

impl ConnectorConfig {
    /// Basic sanity checks before the connector starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connector.name.is_empty() {
            return Err(ConfigError::MissingField("connector.name".to_string()));
        }

        for socket in &self.sockets {
            if socket.name.is_empty() {
                return Err(ConfigError::MissingField("sockets.name".to_string()));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let raw = r#"
            [connector]
            name = "c1"

            [[sockets]]
            name = "db_1"
            host = "127.0.0.1"
            port = 3306
        "#;

        let config: ConnectorConfig = toml::from_str(raw).unwrap();
        config.validate().unwrap();

        assert_eq!(config.connector.name, "c1");
        assert_eq!(config.sockets.len(), 1);
        assert_eq!(config.sockets[0].port, 3306);
        assert!(!config.preserve_upstream_type);
    }

    #[test]
    fn static_socket_forces_cloud_auth() {
        let entry = StaticSocketConfig {
            name: "db_1".into(),
            host: "127.0.0.1".into(),
            port: 3306,
            ..Default::default()
        };

        let socket = entry.to_socket();
        assert!(socket.cloud_auth_enabled);
        assert_eq!(socket.target_port, 3306);
    }

    #[test]
    fn rejects_unnamed_connector() {
        let config = ConnectorConfig::default();
        assert!(config.validate().is_err());
    }
}
