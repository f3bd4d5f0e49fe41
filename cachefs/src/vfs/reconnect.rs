//! Lazy session (re)establishment.
//!
//! The coordinator owns the current session. Every operation asks it for a
//! live one; a faulted or unreachable session is retired (its handles die with
//! it) and a fresh one is connected on demand. No background polling.

use super::session::{RetiredSessions, Session};
use crate::cadapter::Connector;
use crate::config::FsConfig;
use crate::error::{FsError, FsResult};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
    Reconnecting,
}

pub struct ReconnectCoordinator {
    connector: Arc<dyn Connector>,
    config: Arc<FsConfig>,
    current: RwLock<Option<Arc<Session>>>,
    state: Mutex<LinkState>,
    retired: Arc<RetiredSessions>,
}

impl ReconnectCoordinator {
    pub fn new(connector: Arc<dyn Connector>, config: Arc<FsConfig>) -> Self {
        Self {
            connector,
            config,
            current: RwLock::new(None),
            state: Mutex::new(LinkState::Disconnected),
            retired: Arc::new(RetiredSessions::default()),
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: LinkState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != next {
            debug!(from = ?*state, to = ?next, "link state changed");
            *state = next;
        }
    }

    async fn is_healthy(session: &Session) -> bool {
        session.is_active() && session.backend().ping().await.is_ok()
    }

    /// Returns a live session, reconnecting if the current one is gone.
    pub async fn session(&self) -> FsResult<Arc<Session>> {
        {
            let current = self.current.read().await;
            if let Some(session) = current.as_ref() {
                if Self::is_healthy(session).await {
                    return Ok(session.clone());
                }
            }
        }

        let mut current = self.current.write().await;
        // 等待写锁期间其他任务可能已完成重连
        if let Some(session) = current.take() {
            if Self::is_healthy(&session).await {
                *current = Some(session.clone());
                return Ok(session);
            }
            let dropped = session.invalidate();
            warn!(
                session = %session.id(),
                handles = dropped,
                "cluster session lost, handles invalidated"
            );
            self.set_state(LinkState::Disconnected);
        }

        self.set_state(LinkState::Reconnecting);
        let attempts = self.config.reconnect_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.establish().await {
                Ok(session) => {
                    info!(session = %session.id(), attempt, "cluster session established");
                    *current = Some(session.clone());
                    self.set_state(LinkState::Connected);
                    return Ok(session);
                }
                Err(e) if e.is_connectivity() => {
                    debug!(attempt, error = %e, "connect attempt failed");
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.config.reconnect_backoff()).await;
                    }
                }
                Err(e) => {
                    self.set_state(LinkState::Disconnected);
                    return Err(e);
                }
            }
        }
        self.set_state(LinkState::Disconnected);
        warn!(attempts, "cluster is unreachable");
        Err(last_error
            .unwrap_or_else(|| FsError::ConnectivityLost("cluster is unreachable".into())))
    }

    async fn establish(&self) -> FsResult<Arc<Session>> {
        let backend = self.connector.connect().await?;
        let session = Arc::new(Session::new(backend, &self.config, self.retired.clone()));
        session.meta().ensure_root().await?;
        Ok(session)
    }

    /// The current session without health checks, if any.
    pub async fn current(&self) -> Option<Arc<Session>> {
        self.current.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadapter::memory::InMemoryCluster;

    fn coordinator(cluster: &InMemoryCluster, attempts: u32) -> ReconnectCoordinator {
        let config = FsConfig {
            reconnect_attempts: attempts,
            reconnect_backoff_ms: 1,
            ..Default::default()
        };
        ReconnectCoordinator::new(Arc::new(cluster.clone()), Arc::new(config))
    }

    #[tokio::test]
    async fn test_lazy_connect_and_reuse() {
        let cluster = InMemoryCluster::new(2, 0);
        let coord = coordinator(&cluster, 3);
        assert_eq!(coord.state(), LinkState::Disconnected);
        assert!(coord.current().await.is_none());

        let a = coord.session().await.unwrap();
        let b = coord.session().await.unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(coord.state(), LinkState::Connected);
    }

    #[tokio::test]
    async fn test_restart_replaces_session() {
        let cluster = InMemoryCluster::new(2, 0);
        let coord = coordinator(&cluster, 3);
        let old = coord.session().await.unwrap();

        cluster.restart(true);
        let fresh = coord.session().await.unwrap();
        assert_ne!(old.id(), fresh.id());
        assert!(!old.is_active());
        // 重连后根目录被重建
        assert!(fresh.meta().resolve(&crate::meta::FsPath::root()).await.is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_cluster_surfaces_error() {
        let cluster = InMemoryCluster::new(1, 0);
        let coord = coordinator(&cluster, 2);
        coord.session().await.unwrap();

        cluster.stop();
        let err = coord.session().await.unwrap_err();
        assert!(err.is_connectivity());
        assert_eq!(coord.state(), LinkState::Disconnected);

        cluster.start(false);
        coord.session().await.unwrap();
        assert_eq!(coord.state(), LinkState::Connected);
    }
}
