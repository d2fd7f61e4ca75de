//! Owned registry of sessions keyed by client reference
//!
//! Replaces a process-wide client map: whoever needs several sessions owns a
//! [`SessionPool`] and passes it around explicitly.

use super::client::MqttSession;
use crate::config::SessionConfig;
use crate::error::SessionResult;
use crate::events::EventSink;
use crate::transport::Transport;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Builds one fresh transport per session
pub type TransportFactory = Arc<dyn Fn() -> Box<dyn Transport> + Send + Sync>;

pub struct SessionPool {
    sessions: RwLock<HashMap<String, Arc<MqttSession>>>,
    transports: TransportFactory,
    sink: Arc<dyn EventSink>,
}

impl SessionPool {
    pub fn new(transports: TransportFactory, sink: Arc<dyn EventSink>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            transports,
            sink,
        }
    }

    /// Create a session from configuration and return its client reference.
    /// The session starts Disconnected.
    pub async fn create_client(&self, config: &SessionConfig) -> SessionResult<String> {
        let options = config.session_options()?;
        let client_ref = Uuid::new_v4().to_string();

        let session = MqttSession::spawn(
            client_ref.clone(),
            options,
            (self.transports)(),
            Arc::clone(&self.sink),
        );
        self.sessions
            .write()
            .await
            .insert(client_ref.clone(), Arc::new(session));

        info!(
            client_ref = %client_ref,
            client_id = %config.broker.client_id,
            "Session created"
        );
        Ok(client_ref)
    }

    pub async fn get(&self, client_ref: &str) -> Option<Arc<MqttSession>> {
        self.sessions.read().await.get(client_ref).cloned()
    }

    /// Remove a session and tear it down. Returns false for unknown references.
    pub async fn remove_client(&self, client_ref: &str) -> bool {
        let removed = self.sessions.write().await.remove(client_ref);
        match removed {
            Some(session) => {
                if let Err(e) = session.close().await {
                    warn!(client_ref = %client_ref, error = %e, "Session teardown failed");
                }
                info!(client_ref = %client_ref, "Session removed");
                true
            }
            None => {
                debug!(client_ref = %client_ref, "Remove for unknown session ignored");
                false
            }
        }
    }

    /// Disconnect every session; sessions stay in the pool
    pub async fn disconnect_all(&self) {
        let sessions: Vec<Arc<MqttSession>> =
            self.sessions.read().await.values().cloned().collect();
        for session in sessions {
            if let Err(e) = session.disconnect().await {
                warn!(client_ref = %session.client_ref(), error = %e, "Disconnect failed");
            }
        }
    }

    /// Client references, sorted
    pub async fn client_refs(&self) -> Vec<String> {
        let mut refs: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        refs.sort();
        refs
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool").finish_non_exhaustive()
    }
}
