//! Cloud-tag discovery: sockets advertised through instance tags
//!
//! Instances opt in by carrying a tag whose key starts with `border0` and
//! whose value is a `key=value;key=value` label list. The cloud SDK itself
//! stays behind the [`InstanceSource`] seam so this plugin can be exercised
//! without credentials.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::debug;

use b0_core::config::{CloudGroupConfig, ConnectorConfig};
use b0_core::Socket;

use crate::{Discover, DiscoverError, DiscoverState};

const TAG_PREFIX: &str = "border0";

/// A running instance as reported by the cloud provider.
#[derive(Debug, Clone, Default)]
pub struct CloudInstance {
    pub instance_id: String,
    /// Value of the instance `Name` tag, if any.
    pub name: String,
    pub private_ip: String,
    pub tags: HashMap<String, String>,
}

/// Enumerates running instances. Implementations wrap a cloud SDK; tests
/// supply fixtures.
#[async_trait]
pub trait InstanceSource: Send + Sync {
    async fn running_instances(&self) -> Result<Vec<CloudInstance>, DiscoverError>;
}

/// Socket parameters parsed from one `border0*` tag value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketDataTag {
    pub name: String,
    pub port: String,
    pub socket_type: String,
    pub group: String,
    pub host: String,
    pub upstream_type: String,
    pub upstream_username: String,
    pub upstream_password: String,
}

/// Parse a `key=value;key=value` tag label list. Unknown keys are ignored.
pub fn parse_labels(value: &str) -> SocketDataTag {
    let mut data = SocketDataTag::default();

    for pair in value.split(';') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };

        let value = value.trim().to_string();
        match key.trim() {
            "name" => data.name = value,
            "port" => data.port = value,
            "type" => data.socket_type = value,
            "group" => data.group = value,
            "host" => data.host = value,
            "upstream_type" => data.upstream_type = value,
            "upstream_username" => data.upstream_username = value,
            "upstream_password" => data.upstream_password = value,
            _ => {}
        }
    }

    data
}

/// Discovers sockets from cloud instance tags.
pub struct CloudTagFinder {
    source: Box<dyn InstanceSource>,
}

impl CloudTagFinder {
    pub fn new(source: Box<dyn InstanceSource>) -> Self {
        Self { source }
    }

    fn build_socket(
        connector_name: &str,
        group: &CloudGroupConfig,
        data: &SocketDataTag,
        instance: &CloudInstance,
    ) -> Socket {
        let mut socket = Socket {
            target_port: data.port.parse().unwrap_or(0),
            policy_group: group.group.clone(),
            instance_id: instance.instance_id.clone(),
            socket_type: data.socket_type.clone(),
            allowed_email_addresses: group.allowed_email_addresses.clone(),
            allowed_email_domains: group.allowed_email_domains.clone(),
            connector_auth_enabled: group.connector_auth,
            upstream_type: data.upstream_type.clone(),
            upstream_username: data.upstream_username.clone(),
            upstream_password: data.upstream_password.clone(),
            policy_names: group.policies.clone(),
            cloud_auth_enabled: true,
            ..Default::default()
        };

        socket.target_hostname = if data.host.is_empty() {
            instance.private_ip.clone()
        } else {
            data.host.clone()
        };

        socket.name = build_socket_name(
            &instance.name,
            connector_name,
            &data.socket_type,
            &data.name,
        );

        socket
    }
}

/// Compose the socket display name from the tag label (or instance name),
/// the socket type and the connector name.
fn build_socket_name(
    instance_name: &str,
    connector_name: &str,
    socket_type: &str,
    label_name: &str,
) -> String {
    let base = if label_name.is_empty() {
        instance_name
    } else {
        label_name
    };

    let base = base.replace(['_', '.', ' '], "-");

    if socket_type.is_empty() {
        format!("{base}-{connector_name}")
    } else {
        format!("{socket_type}-{base}-{connector_name}")
    }
}

#[async_trait]
impl Discover for CloudTagFinder {
    async fn find(
        &self,
        cfg: &ConnectorConfig,
        _state: &mut DiscoverState,
    ) -> Result<Vec<Socket>, DiscoverError> {
        let instances = self.source.running_instances().await?;
        debug!(count = instances.len(), "enumerated running instances");

        let mut sockets = Vec::new();
        for group in &cfg.cloud_groups {
            for instance in &instances {
                for (key, value) in &instance.tags {
                    if !key.starts_with(TAG_PREFIX) {
                        continue;
                    }

                    let data = parse_labels(value);
                    if data.group == group.group {
                        sockets.push(Self::build_socket(
                            &cfg.connector.name,
                            group,
                            &data,
                            instance,
                        ));
                    }
                }
            }
        }

        Ok(sockets)
    }

    fn skip_run(&self, cfg: &ConnectorConfig, _state: &DiscoverState) -> bool {
        cfg.cloud_groups.is_empty()
    }

    fn wait_seconds(&self) -> u64 {
        10
    }

    fn name(&self) -> &'static str {
        "CloudTagFinder"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixtureSource(Vec<CloudInstance>);

    #[async_trait]
    impl InstanceSource for FixtureSource {
        async fn running_instances(&self) -> Result<Vec<CloudInstance>, DiscoverError> {
            Ok(self.0.clone())
        }
    }

    fn config_with_group(group: &str) -> ConnectorConfig {
        ConnectorConfig {
            connector: b0_core::config::ConnectorSettings {
                name: "c1".into(),
            },
            cloud_groups: vec![CloudGroupConfig {
                group: group.into(),
                policies: vec!["default".into()],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn parses_tag_labels() {
        let data = parse_labels("port=22;type=ssh;group=prod;host=10.1.2.3");
        assert_eq!(
            data,
            SocketDataTag {
                port: "22".into(),
                socket_type: "ssh".into(),
                group: "prod".into(),
                host: "10.1.2.3".into(),
                ..Default::default()
            }
        );

        // malformed pairs and unknown keys are ignored
        let data = parse_labels("port=80;;bogus;color=blue");
        assert_eq!(data.port, "80");
        assert_eq!(data.socket_type, "");
    }

    #[tokio::test]
    async fn discovers_matching_group_instances() {
        let instance = CloudInstance {
            instance_id: "i-0abc".into(),
            name: "web server".into(),
            private_ip: "10.0.0.7".into(),
            tags: HashMap::from([
                ("Name".into(), "web server".into()),
                ("border0_ssh".into(), "port=22;type=ssh;group=prod".into()),
                ("border0_web".into(), "port=80;group=staging".into()),
            ]),
        };

        let finder = CloudTagFinder::new(Box::new(FixtureSource(vec![instance])));
        let cfg = config_with_group("prod");
        let mut state = DiscoverState::default();

        let sockets = finder.find(&cfg, &mut state).await.unwrap();
        assert_eq!(sockets.len(), 1);

        let socket = &sockets[0];
        assert_eq!(socket.name, "ssh-web-server-c1");
        assert_eq!(socket.target_port, 22);
        assert_eq!(socket.target_hostname, "10.0.0.7");
        assert_eq!(socket.instance_id, "i-0abc");
        assert_eq!(socket.policy_names, vec!["default".to_string()]);
        assert!(socket.cloud_auth_enabled);
    }

    #[tokio::test]
    async fn skips_when_no_groups_configured() {
        let finder = CloudTagFinder::new(Box::new(FixtureSource(vec![])));
        let cfg = ConnectorConfig::default();
        assert!(finder.skip_run(&cfg, &DiscoverState::default()));
    }
}
