//! Supervisor: event dispatch, token refresh, and task wiring
//!
//! Three long-lived tasks share one root cancellation token: the reconciler
//! loop, the event dispatcher (single reader of the bounded event channel),
//! and the access-token refresh ticker.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use b0_api::{principal_from_token, Border0Api};
use b0_core::config::ConnectorConfig;
use b0_core::Socket;
use b0_discover::Discover;
use b0_tunnel::{SessionConfig, TunnelHandle, TunnelRegistry, TunnelSession};

use crate::event::SocketEvent;
use crate::reconciler::{ReconcileError, Reconciler};

/// Bounded capacity of the connect/disconnect event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 5;

const TOKEN_REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

/// Launches tunnel sessions for connect events. The indirection keeps the
/// dispatcher testable without touching the network.
pub trait SessionFactory: Send + Sync {
    fn spawn(&self, socket: &Socket, handle: TunnelHandle);
}

/// Production factory: one spawned [`TunnelSession`] per connect event.
pub struct ConnectorSessionFactory {
    api: Arc<dyn Border0Api>,
    registry: Arc<TunnelRegistry>,
    template: SessionConfig,
}

impl ConnectorSessionFactory {
    pub fn new(
        api: Arc<dyn Border0Api>,
        registry: Arc<TunnelRegistry>,
        template: SessionConfig,
    ) -> Self {
        Self {
            api,
            registry,
            template,
        }
    }
}

impl SessionFactory for ConnectorSessionFactory {
    fn spawn(&self, socket: &Socket, handle: TunnelHandle) {
        let cfg = SessionConfig {
            socket_id: socket.socket_id.clone(),
            ..self.template.clone()
        };

        let session = TunnelSession::new(self.api.clone(), self.registry.clone(), cfg);
        tokio::spawn(session.run(handle));
    }
}

/// Single reader of the event channel. Connect events register a handle and
/// spawn a session unless one is already live; disconnect events close and
/// deregister.
pub async fn dispatch_events(
    mut events: mpsc::Receiver<SocketEvent>,
    registry: Arc<TunnelRegistry>,
    factory: Arc<dyn SessionFactory>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            SocketEvent::Connect { socket } => {
                if socket.socket_id.is_empty() {
                    continue;
                }
                if registry.is_connected(&socket.socket_id) {
                    debug!(socket = %socket.name, "tunnel already live, skipping connect");
                    continue;
                }

                let handle = TunnelHandle::child_of(&cancel);
                registry.add(&socket.socket_id, handle.clone());
                factory.spawn(&socket, handle);
            }

            SocketEvent::Disconnect { socket_id } => {
                if let Some(handle) = registry.get(&socket_id) {
                    handle.close();
                }
                registry.remove(&socket_id);
                debug!(socket_id = %socket_id, "tunnel deregistered");
            }
        }
    }

    debug!("event dispatcher stopped");
}

/// Periodically refreshes the access token so long-lived agents outlive the
/// token's validity window.
async fn refresh_token_loop(api: Arc<dyn Border0Api>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(TOKEN_REFRESH_INTERVAL);
    // the first tick fires immediately; the token is still fresh then
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if let Err(err) = api.refresh_token().await {
                    warn!(%err, "access token refresh failed");
                }
            }
        }
    }
}

/// Owns the long-lived connector tasks.
pub struct Supervisor {
    cfg: ConnectorConfig,
    api: Arc<dyn Border0Api>,
    discovery: Box<dyn Discover>,
    registry: Arc<TunnelRegistry>,
    factory: Arc<dyn SessionFactory>,
}

impl Supervisor {
    pub fn new(
        cfg: ConnectorConfig,
        api: Arc<dyn Border0Api>,
        discovery: Box<dyn Discover>,
        registry: Arc<TunnelRegistry>,
        factory: Arc<dyn SessionFactory>,
    ) -> Self {
        Self {
            cfg,
            api,
            discovery,
            registry,
            factory,
        }
    }

    /// Run until the root token is cancelled.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ReconcileError> {
        let principal = principal_from_token(&self.api.access_token())?;
        info!(principal = %principal, "connector starting");

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let reconciler = Reconciler::new(
            self.cfg,
            self.api.clone(),
            self.discovery,
            self.registry.clone(),
            event_tx,
            principal,
        );

        let dispatcher = tokio::spawn(dispatch_events(
            event_rx,
            self.registry,
            self.factory,
            cancel.clone(),
        ));
        let refresher = tokio::spawn(refresh_token_loop(self.api, cancel.clone()));
        let reconcile = tokio::spawn(reconciler.run(cancel));

        let _ = tokio::join!(dispatcher, refresher, reconcile);
        Ok(())
    }
}
