//! b0-discover: socket discovery plugins
//!
//! A discovery plugin enumerates the sockets this connector should expose.
//! The reconciler drives plugins exclusively through the [`Discover`]
//! capability set and never inspects their internals.

mod cloud_tags;
mod static_sockets;

pub use cloud_tags::{CloudInstance, CloudTagFinder, InstanceSource, SocketDataTag};
pub use static_sockets::StaticSocketFinder;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use b0_core::config::ConnectorConfig;
use b0_core::Socket;

/// Discovery errors
#[derive(Debug, Error)]
pub enum DiscoverError {
    /// The underlying instance source failed
    #[error("instance source error: {0}")]
    Source(String),
}

/// Mutable state threaded through discovery runs: a run counter plus an
/// opaque per-plugin memo map.
#[derive(Debug, Clone, Default)]
pub struct DiscoverState {
    pub runs_count: i64,
    pub state: HashMap<String, String>,
}

/// Capability set implemented by every discovery plugin.
#[async_trait]
pub trait Discover: Send + Sync {
    /// Enumerate the desired sockets.
    async fn find(
        &self,
        cfg: &ConnectorConfig,
        state: &mut DiscoverState,
    ) -> Result<Vec<Socket>, DiscoverError>;

    /// Whether this run should be skipped entirely.
    fn skip_run(&self, cfg: &ConnectorConfig, state: &DiscoverState) -> bool;

    /// Delay between runs, in seconds.
    fn wait_seconds(&self) -> u64;

    /// Stable plugin name, recorded in socket ownership metadata.
    fn name(&self) -> &'static str;
}
