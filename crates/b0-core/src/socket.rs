//! Socket and connector-data model
//!
//! Mirrors the control plane's socket representation. The `tags` map is the
//! server-side source of truth for connector ownership: `ConnectorData` is
//! rebuilt from `tags` on read and mirrored back into `tags` on write.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

const TAG_MANAGED_BY: &str = "managed_by";

/// Connector ownership metadata embedded in a socket.
///
/// The three-field key (name; connector; plugin) defines equality for
/// reconciliation purposes. A value with empty name, connector, type and
/// port has no key and is not owned by any connector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectorData {
    pub name: String,
    pub connector: String,
    pub socket_type: String,
    pub port: u16,
    pub target_hostname: String,
    pub policy_group: String,
    pub ec2_tag: String,
    pub instance_id: String,
    pub plugin_name: String,
    pub managed_by: String,
}

impl ConnectorData {
    /// Identity key used to match discovered sockets against the control
    /// plane inventory. Empty when the socket is unowned.
    pub fn key(&self) -> String {
        if self.name.is_empty()
            && self.connector.is_empty()
            && self.socket_type.is_empty()
            && self.port == 0
        {
            return String::new();
        }

        format!("{};{};{}", self.name, self.connector, self.plugin_name)
    }

    /// Serialize into the tag map stored on the server.
    ///
    /// `managed_by` is omitted when empty so that older inventory entries
    /// round-trip unchanged.
    pub fn tags(&self) -> HashMap<String, String> {
        let mut data = HashMap::from([
            ("name".to_string(), self.name.clone()),
            ("connector_name".to_string(), self.connector.clone()),
            ("type".to_string(), self.socket_type.clone()),
            ("target_port".to_string(), self.port.to_string()),
            ("target_hostname".to_string(), self.target_hostname.clone()),
            ("ec2_tag".to_string(), self.ec2_tag.clone()),
            ("policy_group".to_string(), self.policy_group.clone()),
            ("instance_id".to_string(), self.instance_id.clone()),
            ("plugin_name".to_string(), self.plugin_name.clone()),
        ]);

        if !self.managed_by.is_empty() {
            data.insert(TAG_MANAGED_BY.to_string(), self.managed_by.clone());
        }

        data
    }

    /// Rebuild connector data from a server-side tag map.
    pub fn from_tags(tags: &HashMap<String, String>) -> Self {
        let get = |key: &str| tags.get(key).cloned().unwrap_or_default();

        Self {
            name: get("name"),
            connector: get("connector_name"),
            socket_type: get("type"),
            port: get("target_port").parse().unwrap_or(0),
            target_hostname: get("target_hostname"),
            ec2_tag: get("ec2_tag"),
            instance_id: get("instance_id"),
            policy_group: get("policy_group"),
            plugin_name: get("plugin_name"),
            managed_by: get(TAG_MANAGED_BY),
        }
    }
}

/// A per-socket tunnel descriptor returned by the control plane.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tunnel {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tunnel_id: String,
    #[serde(default, skip_serializing_if = "is_zero_u16")]
    pub local_port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tunnel_server: String,
}

/// An access policy attached to a socket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub org_wide: bool,
}

/// Organization info; `certificates` carries `ssh_public_key` and
/// `mtls_certificate` PEM blobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Organization {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub certificates: HashMap<String, String>,
}

/// A logical exposed endpoint managed by the connector.
///
/// Field names follow the control plane's JSON contract (including its
/// historical misspellings); fields below the `skip` block never travel on
/// the wire and exist only for reconciliation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Socket {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tunnels: Vec<Tunnel>,
    #[serde(default, rename = "user_name", skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub socket_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub socket_tcp_ports: Vec<u16>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dnsname: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub socket_type: String,
    #[serde(
        default,
        rename = "cloud_authentication_email_allowed_addressses",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub allowed_email_addresses: Vec<String>,
    #[serde(
        default,
        rename = "cloud_authentication_email_allowed_domains",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub allowed_email_domains: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ssh_ca: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub upstream_username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub upstream_password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_cert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_ca: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub upstream_http_hostname: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub upstream_type: String,
    #[serde(default, rename = "cloud_authentication_enabled")]
    pub cloud_auth_enabled: bool,
    #[serde(default, rename = "connector_authentication_enabled")]
    pub connector_auth_enabled: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policy_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policies: Vec<Policy>,

    #[serde(skip)]
    pub target_hostname: String,
    #[serde(skip)]
    pub target_port: u16,
    #[serde(skip)]
    pub policy_group: String,
    #[serde(skip)]
    pub ec2_tag: String,
    #[serde(skip)]
    pub instance_id: String,
    #[serde(skip)]
    pub plugin_name: String,
    #[serde(skip)]
    pub connector_data: Option<ConnectorData>,
}

fn is_zero_u16(v: &u16) -> bool {
    *v == 0
}

impl Socket {
    /// Replace `.`, `_` and spaces in the display name with `-`.
    pub fn sanitize_name(&mut self) {
        self.name = self
            .name
            .replace('.', "-")
            .replace(' ', "-")
            .replace('_', "-");
    }

    /// Build the ownership block from this socket's local fields.
    pub fn build_connector_data(&mut self, connector_name: &str, principal: &str) {
        self.connector_data = Some(ConnectorData {
            name: self.name.clone(),
            connector: connector_name.to_string(),
            socket_type: self.socket_type.clone(),
            port: self.target_port,
            target_hostname: self.target_hostname.clone(),
            policy_group: self.policy_group.clone(),
            ec2_tag: self.ec2_tag.clone(),
            instance_id: self.instance_id.clone(),
            plugin_name: self.plugin_name.clone(),
            managed_by: principal.to_string(),
        });
    }

    /// Build the ownership block and mirror it into `tags`.
    pub fn build_connector_data_and_tags(&mut self, connector_name: &str, principal: &str) {
        self.build_connector_data(connector_name, principal);
        self.tags = self
            .connector_data
            .as_ref()
            .map(ConnectorData::tags)
            .unwrap_or_default();
    }

    /// Rebuild the ownership block from the server-provided `tags`.
    ///
    /// A socket without tags gets an empty block, which yields an empty
    /// identity key and is treated as unowned.
    pub fn build_connector_data_by_tags(&mut self) {
        if self.tags.is_empty() {
            self.connector_data = Some(ConnectorData::default());
            return;
        }

        self.connector_data = Some(ConnectorData::from_tags(&self.tags));
    }

    /// Identity key of the ownership block, empty when absent or unowned.
    pub fn connector_key(&self) -> String {
        self.connector_data
            .as_ref()
            .map(ConnectorData::key)
            .unwrap_or_default()
    }

    /// Infer `socket_type` and `upstream_type` from the explicit type or the
    /// target port. Only runs when `upstream_type` is still empty.
    pub fn infer_types(&mut self) {
        if !self.upstream_type.is_empty() {
            return;
        }

        self.upstream_type = "http".to_string();

        if !self.socket_type.is_empty() {
            match self.socket_type.as_str() {
                "mysql" => {
                    self.upstream_type = "mysql".to_string();
                    self.socket_type = "database".to_string();
                }
                "postgres" => {
                    self.upstream_type = "postgres".to_string();
                    self.socket_type = "database".to_string();
                }
                "database" => {
                    if self.target_port == 3306 {
                        self.upstream_type = "mysql".to_string();
                    }
                    if self.target_port == 5432 {
                        self.upstream_type = "postgres".to_string();
                    }
                }
                "https" => {
                    self.socket_type = "http".to_string();
                    self.upstream_type = "https".to_string();
                }
                _ => {}
            }
            return;
        }

        match self.target_port {
            3306 => {
                self.socket_type = "database".to_string();
                self.upstream_type = "mysql".to_string();
            }
            5432 => {
                self.socket_type = "database".to_string();
                self.upstream_type = "postgres".to_string();
            }
            22 => self.socket_type = "ssh".to_string(),
            80 => self.socket_type = "http".to_string(),
            443 => {
                self.socket_type = "http".to_string();
                self.upstream_type = "https".to_string();
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data() -> ConnectorData {
        ConnectorData {
            name: "db-1".into(),
            connector: "c1".into(),
            socket_type: "database".into(),
            port: 3306,
            target_hostname: "10.0.0.5".into(),
            policy_group: "prod".into(),
            ec2_tag: "border0".into(),
            instance_id: "i-0abc".into(),
            plugin_name: "static".into(),
            managed_by: "user:42".into(),
        }
    }

    #[test]
    fn tags_round_trip() {
        let data = sample_data();
        assert_eq!(ConnectorData::from_tags(&data.tags()), data);
    }

    #[test]
    fn tags_round_trip_without_managed_by() {
        let mut data = sample_data();
        data.managed_by = String::new();

        let tags = data.tags();
        assert!(!tags.contains_key("managed_by"));
        assert_eq!(ConnectorData::from_tags(&tags), data);
    }

    #[test]
    fn key_is_empty_for_unowned_socket() {
        assert_eq!(ConnectorData::default().key(), "");

        let data = sample_data();
        assert_eq!(data.key(), "db-1;c1;static");
    }

    #[test]
    fn sanitize_name_strips_separators() {
        let mut socket = Socket {
            name: "my_db.socket one".into(),
            ..Default::default()
        };
        socket.sanitize_name();
        assert_eq!(socket.name, "my-db-socket-one");

        // idempotent
        socket.sanitize_name();
        assert_eq!(socket.name, "my-db-socket-one");
    }

    #[test]
    fn infer_types_by_port() {
        let cases = [
            (3306, "database", "mysql"),
            (5432, "database", "postgres"),
            (22, "ssh", "http"),
            (80, "http", "http"),
            (443, "http", "https"),
        ];

        for (port, socket_type, upstream_type) in cases {
            let mut socket = Socket {
                target_port: port,
                ..Default::default()
            };
            socket.infer_types();
            assert_eq!(socket.socket_type, socket_type, "port {port}");
            assert_eq!(socket.upstream_type, upstream_type, "port {port}");
        }
    }

    #[test]
    fn infer_types_promotes_explicit_database_flavors() {
        let mut socket = Socket {
            socket_type: "mysql".into(),
            ..Default::default()
        };
        socket.infer_types();
        assert_eq!(socket.socket_type, "database");
        assert_eq!(socket.upstream_type, "mysql");

        let mut socket = Socket {
            socket_type: "https".into(),
            ..Default::default()
        };
        socket.infer_types();
        assert_eq!(socket.socket_type, "http");
        assert_eq!(socket.upstream_type, "https");
    }

    #[test]
    fn infer_types_keeps_explicit_upstream() {
        let mut socket = Socket {
            socket_type: "http".into(),
            upstream_type: "https".into(),
            target_port: 3306,
            ..Default::default()
        };
        socket.infer_types();
        assert_eq!(socket.socket_type, "http");
        assert_eq!(socket.upstream_type, "https");
    }

    #[test]
    fn socket_serializes_wire_names() {
        let socket = Socket {
            socket_id: "sock-1".into(),
            name: "db-1".into(),
            allowed_email_addresses: vec!["a@example.com".into()],
            cloud_auth_enabled: true,
            ..Default::default()
        };

        let json = serde_json::to_value(&socket).unwrap();
        assert_eq!(json["socket_id"], "sock-1");
        assert_eq!(
            json["cloud_authentication_email_allowed_addressses"][0],
            "a@example.com"
        );
        assert_eq!(json["cloud_authentication_enabled"], true);
        // reconciliation-only fields never hit the wire
        assert!(json.get("target_port").is_none());
    }
}
