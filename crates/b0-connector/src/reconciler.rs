//! Socket reconciliation
//!
//! One tick: discover the desired sockets, diff them against the
//! control-plane inventory, apply creates/updates/recreates/deletes, and
//! emit connect events for sockets without a live tunnel. Deletes run
//! before creates so an identity-key change appears on the control plane as
//! a delete strictly followed by a create. Per-socket control-plane errors
//! are logged and retried implicitly on the next tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use b0_api::{ApiError, Border0Api};
use b0_core::config::ConnectorConfig;
use b0_core::Socket;
use b0_discover::{Discover, DiscoverError, DiscoverState};
use b0_tunnel::TunnelRegistry;

use crate::event::SocketEvent;

/// Delay before re-checking a plugin that declined its run.
const SKIP_RECHECK_DELAY: Duration = Duration::from_secs(1);

/// Reconciliation errors that abort a tick.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Discovery failed; nothing to diff
    #[error(transparent)]
    Discover(#[from] DiscoverError),

    /// The inventory could not be fetched
    #[error(transparent)]
    Api(#[from] ApiError),

    /// The event channel is gone; the supervisor is shutting down
    #[error("event channel closed")]
    ChannelClosed,
}

/// Diffs discovered sockets against the control plane.
pub struct Reconciler {
    cfg: ConnectorConfig,
    api: Arc<dyn Border0Api>,
    discovery: Box<dyn Discover>,
    registry: Arc<TunnelRegistry>,
    events: mpsc::Sender<SocketEvent>,
    principal: String,
    runs: i64,
    state: DiscoverState,
}

impl Reconciler {
    pub fn new(
        cfg: ConnectorConfig,
        api: Arc<dyn Border0Api>,
        discovery: Box<dyn Discover>,
        registry: Arc<TunnelRegistry>,
        events: mpsc::Sender<SocketEvent>,
        principal: String,
    ) -> Self {
        Self {
            cfg,
            api,
            discovery,
            registry,
            events,
            principal,
            runs: 0,
            state: DiscoverState::default(),
        }
    }

    /// Loop ticks with the plugin's inter-tick delay until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }

            // skip-run is decided before the inter-tick delay; a declined
            // run never pays the plugin's wait
            self.state.runs_count = self.runs;
            if self.discovery.skip_run(&self.cfg, &self.state) {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(SKIP_RECHECK_DELAY) => {}
                }
                continue;
            }

            if self.runs != 0 {
                let wait = Duration::from_secs(self.discovery.wait_seconds());
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(wait) => {}
                }
            }

            match self.tick().await {
                Ok(()) => {}
                Err(ReconcileError::ChannelClosed) => return,
                Err(err) => error!(%err, "reconcile tick failed"),
            }
        }
    }

    /// Run one discover/diff cycle.
    pub async fn tick(&mut self) -> Result<(), ReconcileError> {
        self.state.runs_count = self.runs;

        if self.discovery.skip_run(&self.cfg, &self.state) {
            return Ok(());
        }

        let mut discovered = self.discovery.find(&self.cfg, &mut self.state).await?;
        self.runs += 1;

        let to_connect = self.sync_sockets(&mut discovered).await?;

        for socket in to_connect {
            if socket.socket_id.is_empty() {
                continue;
            }
            if !self.registry.is_connected(&socket.socket_id) {
                info!(socket = %socket.name, "found new socket to connect");
                self.events
                    .send(SocketEvent::Connect { socket })
                    .await
                    .map_err(|_| ReconcileError::ChannelClosed)?;
            }
        }

        Ok(())
    }

    /// Diff the discovered set against the inventory and return the sockets
    /// that should have a tunnel.
    async fn sync_sockets(
        &self,
        discovered: &mut [Socket],
    ) -> Result<Vec<Socket>, ReconcileError> {
        let plugin_name = self.discovery.name();

        // bootstrap discovered sockets: ownership metadata before type
        // inference, so tags mirror the raw discovered values
        let mut local_map: HashMap<String, Socket> = HashMap::new();
        for socket in discovered.iter_mut() {
            socket.plugin_name = plugin_name.to_string();
            socket.sanitize_name();
            socket.build_connector_data_and_tags(&self.cfg.connector.name, &self.principal);
            socket.infer_types();
            local_map.insert(socket.connector_key(), socket.clone());
        }

        let mut from_api = self.api.get_sockets().await?;

        let mut api_map: HashMap<String, Socket> = HashMap::new();
        for socket in from_api.iter_mut() {
            socket.build_connector_data_by_tags();
            if socket.connector_key().is_empty() {
                continue;
            }

            let attached: Vec<String> =
                socket.policies.iter().map(|p| p.name.clone()).collect();
            socket.policy_names.extend(attached);
            api_map.insert(socket.connector_key(), socket.clone());
        }

        info!(
            plugin_name,
            local_sockets = discovered.len(),
            api_sockets = from_api.len(),
            connected_tunnels = self.registry.len(),
            "sockets found"
        );

        self.delete_pass(&from_api, &mut local_map, &mut api_map)
            .await?;

        let to_connect = self.create_update_pass(discovered, &api_map).await;
        info!(sockets_to_connect = to_connect.len(), "reconcile pass complete");

        Ok(to_connect)
    }

    /// Remove or recreate inventory sockets that no longer match discovery.
    async fn delete_pass(
        &self,
        from_api: &[Socket],
        local_map: &mut HashMap<String, Socket>,
        api_map: &mut HashMap<String, Socket>,
    ) -> Result<(), ReconcileError> {
        for api_socket in from_api {
            let key = api_socket.connector_key();
            if key.is_empty() {
                // not owned by any connector
                continue;
            }

            if let Some(local) = local_map.get(&key) {
                if local.connector_data != api_socket.connector_data {
                    info!(
                        socket = %api_socket.name,
                        "connector data changed, recreating socket"
                    );

                    match self.recreate_socket(&api_socket.socket_id, local.clone()).await {
                        Ok(created) => {
                            local_map.insert(key.clone(), created.clone());
                            api_map.insert(key, created);
                        }
                        Err(err) => {
                            error!(socket = %api_socket.name, %err, "recreate failed");
                        }
                    }
                }
            } else if api_socket
                .connector_data
                .as_ref()
                .map(|data| {
                    data.connector == self.cfg.connector.name
                        && data.plugin_name == self.discovery.name()
                })
                .unwrap_or(false)
            {
                info!(
                    socket = %api_socket.name,
                    key = %key,
                    "socket gone from discovery, deleting"
                );

                // close the tunnel before the socket disappears server-side
                self.events
                    .send(SocketEvent::Disconnect {
                        socket_id: api_socket.socket_id.clone(),
                    })
                    .await
                    .map_err(|_| ReconcileError::ChannelClosed)?;

                if let Err(err) = self.api.delete_socket(&api_socket.socket_id).await {
                    error!(socket = %api_socket.name, %err, "delete failed");
                }
            }
        }

        Ok(())
    }

    /// Create missing sockets, update diverged ones, and collect the
    /// resulting to-connect set.
    async fn create_update_pass(
        &self,
        discovered: &[Socket],
        api_map: &HashMap<String, Socket>,
    ) -> Vec<Socket> {
        let mut to_connect = Vec::new();

        for local in discovered {
            match api_map.get(&local.connector_key()) {
                None => {
                    info!(socket = %local.name, "creating socket");
                    match self.create_socket(local).await {
                        Ok(mut created) => {
                            created.plugin_name = self.discovery.name().to_string();
                            created.build_connector_data(
                                &self.cfg.connector.name,
                                &self.principal,
                            );
                            to_connect.push(created);
                        }
                        Err(err) => {
                            error!(socket = %local.name, %err, "create failed");
                        }
                    }
                }
                Some(api_socket) => {
                    match self.check_and_update(api_socket.clone(), local).await {
                        Ok(updated) => to_connect.push(updated),
                        Err(err) => {
                            error!(socket = %local.name, %err, "update failed");
                        }
                    }
                }
            }
        }

        to_connect
    }

    /// Delete then create: an identity-key change must be visible in that
    /// order on the control plane.
    async fn recreate_socket(
        &self,
        old_socket_id: &str,
        local: Socket,
    ) -> Result<Socket, ApiError> {
        self.api.delete_socket(old_socket_id).await?;

        let mut created = self.create_socket(&local).await?;
        created.build_connector_data_by_tags();
        Ok(created)
    }

    async fn create_socket(&self, socket: &Socket) -> Result<Socket, ApiError> {
        let mut spec = socket.clone();
        if spec.description.is_empty() {
            spec.description = format!("created by {}", self.cfg.connector.name);
        }

        let mut created = self.api.create_socket(&spec).await?;

        if let Err(err) = self.api.apply_policies(&created, &socket.policy_names).await {
            error!(socket = %created.name, %err, "applying policies failed");
        }
        created.policy_names = socket.policy_names.clone();

        Ok(created)
    }

    /// Compare tracked fields; on divergence push the local values.
    async fn check_and_update(
        &self,
        mut api_socket: Socket,
        local: &Socket,
    ) -> Result<Socket, ApiError> {
        let mut in_sync = string_sets_equal(
            &api_socket.allowed_email_addresses,
            &local.allowed_email_addresses,
        ) && string_sets_equal(
            &api_socket.allowed_email_domains,
            &local.allowed_email_domains,
        );

        // policy comparison only when either side carries policies
        if !api_socket.policy_names.is_empty() || !local.policy_names.is_empty() {
            in_sync =
                in_sync && string_sets_equal(&api_socket.policy_names, &local.policy_names);
        }

        if in_sync
            && api_socket.upstream_http_hostname == local.upstream_http_hostname
            && api_socket.upstream_username == local.upstream_username
            && api_socket.upstream_type == local.upstream_type
            && api_socket.connector_auth_enabled == local.connector_auth_enabled
        {
            return Ok(api_socket);
        }

        api_socket.allowed_email_addresses = local.allowed_email_addresses.clone();
        api_socket.allowed_email_domains = local.allowed_email_domains.clone();
        api_socket.upstream_http_hostname = local.upstream_http_hostname.clone();
        api_socket.upstream_username = local.upstream_username.clone();
        api_socket.connector_auth_enabled = local.connector_auth_enabled;
        if !self.cfg.preserve_upstream_type {
            // cleared so the control plane re-infers it on write
            api_socket.upstream_type = String::new();
        }
        api_socket.cloud_auth_enabled = true;
        api_socket.tags = local.tags.clone();

        if let Err(err) = self
            .api
            .apply_policies(&api_socket, &local.policy_names)
            .await
        {
            warn!(socket = %api_socket.name, %err, "applying policies failed");
        }
        api_socket.policy_names = local.policy_names.clone();

        self.api
            .update_socket(&api_socket.socket_id, &api_socket)
            .await?;
        info!(socket = %api_socket.name, "socket updated from local to api");

        Ok(api_socket)
    }
}

/// Order-insensitive string set comparison.
fn string_sets_equal(a: &[String], b: &[String]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort();
    b.sort();
    a == b
}
