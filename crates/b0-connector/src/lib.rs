//! b0-connector: reconciliation core and supervisor
//!
//! Turns a discovery source plus the control-plane inventory into a target
//! set of sockets, and keeps one live tunnel per active socket through the
//! event dispatcher.

mod event;
mod reconciler;
mod supervisor;

pub use event::SocketEvent;
pub use reconciler::{Reconciler, ReconcileError};
pub use supervisor::{
    dispatch_events, ConnectorSessionFactory, SessionFactory, Supervisor,
    EVENT_CHANNEL_CAPACITY,
};
