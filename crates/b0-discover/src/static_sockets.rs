//! Static discovery: sockets declared in the configuration file

use async_trait::async_trait;

use b0_core::config::ConnectorConfig;
use b0_core::Socket;

use crate::{Discover, DiscoverError, DiscoverState};

/// Materializes the `[[sockets]]` entries from the connector configuration.
#[derive(Debug, Default)]
pub struct StaticSocketFinder;

#[async_trait]
impl Discover for StaticSocketFinder {
    async fn find(
        &self,
        cfg: &ConnectorConfig,
        _state: &mut DiscoverState,
    ) -> Result<Vec<Socket>, DiscoverError> {
        Ok(cfg.sockets.iter().map(|entry| entry.to_socket()).collect())
    }

    fn skip_run(&self, _cfg: &ConnectorConfig, _state: &DiscoverState) -> bool {
        false
    }

    fn wait_seconds(&self) -> u64 {
        30
    }

    fn name(&self) -> &'static str {
        "StaticSocketFinder"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use b0_core::config::StaticSocketConfig;

    #[tokio::test]
    async fn materializes_configured_sockets() {
        let cfg = ConnectorConfig {
            sockets: vec![StaticSocketConfig {
                name: "db_1".into(),
                host: "127.0.0.1".into(),
                port: 3306,
                ..Default::default()
            }],
            ..Default::default()
        };

        let finder = StaticSocketFinder;
        let mut state = DiscoverState::default();
        let sockets = finder.find(&cfg, &mut state).await.unwrap();

        assert_eq!(sockets.len(), 1);
        assert_eq!(sockets[0].name, "db_1");
        assert_eq!(sockets[0].target_port, 3306);
        assert!(sockets[0].cloud_auth_enabled);
        assert!(!finder.skip_run(&cfg, &state));
        assert_eq!(finder.wait_seconds(), 30);
    }
}
