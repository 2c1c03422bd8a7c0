use crate::backend::{Backend, BackendError};
use crate::metrics::Metrics;
use crate::poll::MetricsPoller;
use crate::session::{now_unix, Credential, Host, Session, SessionRegistry, SessionState};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Discovery failures are opaque: surfaced once to the operator, no retry.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery failed: {0}")]
    Backend(#[from] BackendError),
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("host must not be empty")]
    EmptyHost,
    /// The backend's rejection, forwarded verbatim. Whether it was an auth
    /// failure, an unreachable host, or a kinit failure is the backend's
    /// taxonomy, not ours.
    #[error("{0}")]
    Backend(BackendError),
}

/// Front door for operator actions: discover candidate hosts, establish a
/// session (which registers the host and starts its poller), tear one down.
pub struct ConnectionManager {
    backend: Arc<dyn Backend>,
    registry: SessionRegistry,
    poller: MetricsPoller,
    metrics: Arc<Metrics>,
    default_ssh_user: String,
    connected_tx: broadcast::Sender<Host>,
}

impl ConnectionManager {
    pub fn new(
        backend: Arc<dyn Backend>,
        registry: SessionRegistry,
        poller: MetricsPoller,
        metrics: Arc<Metrics>,
        default_ssh_user: String,
    ) -> Self {
        let (connected_tx, _) = broadcast::channel(16);
        Self {
            backend,
            registry,
            poller,
            metrics,
            default_ssh_user,
            connected_tx,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn poller(&self) -> &MetricsPoller {
        &self.poller
    }

    /// Notification stream carrying each newly connected host, so the
    /// presentation layer can start subscribing to its metrics.
    pub fn subscribe_connected(&self) -> broadcast::Receiver<Host> {
        self.connected_tx.subscribe()
    }

    /// Single forwarded scan request. No retry or backoff here.
    pub async fn discover(&self, range: &str) -> Result<Vec<Host>, DiscoveryError> {
        match self.backend.discover(range).await {
            Ok(hosts) => {
                info!(range, count = hosts.len(), "discovery completed");
                Ok(hosts)
            }
            Err(err) => {
                self.metrics.inc_discover_error();
                warn!(range, error = %err, "discovery failed");
                Err(DiscoveryError::Backend(err))
            }
        }
    }

    /// Requests a remote session exactly once. On success the host is
    /// upserted into the registry and its poller starts; reconnecting an
    /// already-connected host replaces the entry and the poller instead of
    /// stacking duplicates. A rejected attempt leaves no registry trace.
    pub async fn connect(
        &self,
        host: Host,
        mut credential: Credential,
    ) -> Result<Session, ConnectError> {
        if host.as_str().trim().is_empty() {
            return Err(ConnectError::EmptyHost);
        }
        if credential.ssh_user.trim().is_empty() {
            credential.ssh_user = self.default_ssh_user.clone();
        }

        let mut session = Session::connecting(host.clone(), now_unix());

        if let Err(err) = self.backend.request_session(&host, &credential).await {
            session.state = SessionState::Failed(err.to_string());
            self.metrics.inc_connect("rejected");
            warn!(host = %host, error = %err, "connect rejected by backend");
            // A failed attempt is never inserted; retry is a fresh connect.
            return Err(ConnectError::Backend(err));
        }

        session.state = SessionState::Connected;
        session.connected_at_unix = now_unix();
        self.registry.upsert(session.clone()).await;
        self.poller.start(host.clone());
        self.metrics.inc_connect("connected");
        self.metrics
            .set_connected_sessions(self.registry.len().await);
        info!(host = %host, user = %credential.ssh_user, "host connected");

        let _ = self.connected_tx.send(host);
        Ok(session)
    }

    /// Removes the host from the registry and cancels its poller.
    pub async fn disconnect(&self, host: &Host) -> bool {
        let removed = self.registry.remove(host).await.is_some();
        self.poller.stop(host);
        if removed {
            self.metrics
                .set_connected_sessions(self.registry.len().await);
            info!(host = %host, "host disconnected");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FetchError;
    use crate::session::SessionState;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct FakeBackend {
        session_outcomes: Mutex<VecDeque<Result<(), BackendError>>>,
        discover_hosts: Mutex<Result<Vec<Host>, BackendError>>,
        session_calls: AtomicUsize,
        last_user: Mutex<Option<String>>,
    }

    impl FakeBackend {
        fn accepting() -> Arc<Self> {
            Arc::new(Self {
                session_outcomes: Mutex::new(VecDeque::new()),
                discover_hosts: Mutex::new(Ok(Vec::new())),
                session_calls: AtomicUsize::new(0),
                last_user: Mutex::new(None),
            })
        }

        fn rejecting(reason: &str) -> Arc<Self> {
            let backend = Self::accepting();
            backend
                .session_outcomes
                .lock()
                .unwrap()
                .push_back(Err(BackendError::Rejected(reason.to_string())));
            backend
        }
    }

    #[async_trait]
    impl Backend for FakeBackend {
        async fn discover(&self, _range: &str) -> Result<Vec<Host>, BackendError> {
            std::mem::replace(&mut *self.discover_hosts.lock().unwrap(), Ok(Vec::new()))
        }

        async fn request_session(
            &self,
            _host: &Host,
            credential: &Credential,
        ) -> Result<(), BackendError> {
            self.session_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_user.lock().unwrap() = Some(credential.ssh_user.clone());
            self.session_outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(()))
        }

        async fn fetch_metrics(&self, _host: &Host) -> Result<Value, FetchError> {
            Ok(json!({"cpu_percent": 0.0, "mem_percent": 0.0}))
        }
    }

    fn manager(backend: Arc<FakeBackend>) -> ConnectionManager {
        let registry = SessionRegistry::new();
        let metrics = Metrics::new().expect("metrics init");
        let poller = MetricsPoller::new(
            backend.clone(),
            registry.clone(),
            metrics.clone(),
            Duration::from_secs(5),
        );
        ConnectionManager::new(backend, registry, poller, metrics, "ops".to_string())
    }

    fn password_credential() -> Credential {
        Credential {
            ssh_user: "admin".to_string(),
            ssh_password: Some("x".to_string()),
            ..Credential::default()
        }
    }

    #[tokio::test]
    async fn successful_connect_registers_and_starts_one_poller() {
        let backend = FakeBackend::accepting();
        let manager = manager(backend.clone());
        let host = Host::from("10.0.0.5");
        let mut connected_rx = manager.subscribe_connected();

        let session = manager
            .connect(host.clone(), password_credential())
            .await
            .expect("connect must succeed");
        assert_eq!(session.state, SessionState::Connected);

        let registered = manager.registry().get(&host).await.expect("must exist");
        assert!(registered.is_connected());
        assert_eq!(manager.registry().list().await, vec![host.clone()]);
        assert!(manager.poller().is_running(&host));
        assert_eq!(manager.poller().running_count(), 1);
        assert_eq!(connected_rx.recv().await.expect("notification"), host);
        assert_eq!(backend.session_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reconnect_is_idempotent() {
        let backend = FakeBackend::accepting();
        let manager = manager(backend);
        let host = Host::from("10.0.0.5");

        manager
            .connect(host.clone(), password_credential())
            .await
            .expect("first connect");
        manager
            .connect(host.clone(), password_credential())
            .await
            .expect("second connect");

        assert_eq!(manager.registry().len().await, 1);
        assert_eq!(manager.poller().running_count(), 1);
    }

    #[tokio::test]
    async fn rejected_connect_leaves_no_trace() {
        let backend = FakeBackend::rejecting("authentication failed");
        let manager = manager(backend);
        let host = Host::from("10.0.0.9");

        let err = manager
            .connect(host.clone(), password_credential())
            .await
            .expect_err("connect must fail");
        assert!(err.to_string().contains("authentication failed"));

        assert!(!manager.registry().contains(&host).await);
        assert!(!manager.poller().is_running(&host));
    }

    #[tokio::test]
    async fn empty_host_is_rejected_without_backend_call() {
        let backend = FakeBackend::accepting();
        let manager = manager(backend.clone());

        let err = manager
            .connect(Host::from("  "), password_credential())
            .await
            .expect_err("connect must fail");
        assert!(matches!(err, ConnectError::EmptyHost));
        assert_eq!(backend.session_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_ssh_user_falls_back_to_default() {
        let backend = FakeBackend::accepting();
        let manager = manager(backend.clone());

        manager
            .connect(
                Host::from("10.0.0.5"),
                Credential {
                    ssh_user: String::new(),
                    ssh_password: Some("x".to_string()),
                    ..Credential::default()
                },
            )
            .await
            .expect("connect must succeed");

        let user = backend.last_user.lock().unwrap().clone();
        assert_eq!(user.as_deref(), Some("ops"));
    }

    #[tokio::test]
    async fn disconnect_removes_registry_entry_and_poller() {
        let backend = FakeBackend::accepting();
        let manager = manager(backend);
        let host = Host::from("10.0.0.5");
        manager
            .connect(host.clone(), password_credential())
            .await
            .expect("connect");

        assert!(manager.disconnect(&host).await);
        assert!(!manager.registry().contains(&host).await);
        assert!(!manager.poller().is_running(&host));
        assert!(!manager.disconnect(&host).await);
    }

    #[tokio::test]
    async fn discover_forwards_hosts_and_surfaces_errors() {
        let backend = FakeBackend::accepting();
        *backend.discover_hosts.lock().unwrap() =
            Ok(vec![Host::from("10.0.0.5"), Host::from("10.0.0.9")]);
        let manager = manager(backend.clone());

        let hosts = manager.discover("10.0.0.0/24").await.expect("discover");
        assert_eq!(hosts, vec![Host::from("10.0.0.5"), Host::from("10.0.0.9")]);

        *backend.discover_hosts.lock().unwrap() =
            Err(BackendError::Transport("scan timed out".to_string()));
        let err = manager.discover("10.0.0.0/24").await.expect_err("error");
        assert!(err.to_string().contains("scan timed out"));
    }
}
