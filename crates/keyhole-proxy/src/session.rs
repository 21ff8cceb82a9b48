use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use keyhole_tls::CertificateStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ProxyConfig;
use crate::errors::{BridgeError, CredentialError, ProxyError, SessionError};
use crate::request_log::RequestLog;
use crate::server::{InterceptingProxy, ServerRunSummary};

/// Extra slack on top of the configured drain timeout before the server task
/// is abandoned outright.
const DRAIN_SLACK: Duration = Duration::from_secs(2);

/// A short-lived bearer credential for the impersonated identity, produced
/// by an external issuer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessCredential {
    pub bearer_token: String,
    pub expires_at: SystemTime,
}

/// Issues an `AccessCredential` for a target identity, annotated with the
/// operator's audit reason. Possibly slow, possibly failing; called once
/// before the session starts.
pub trait CredentialSource {
    fn fetch(&self, target_identity: &str, reason: &str)
        -> Result<AccessCredential, CredentialError>;
}

/// Points the client tool at the proxy and reverts that configuration.
/// Both operations are idempotent, and `revert` must be safe to call even if
/// `point_at_proxy` never ran successfully.
pub trait ClientConfigBridge {
    fn point_at_proxy(&self, proxy_addr: SocketAddr, ca_cert_path: &Path)
        -> Result<(), BridgeError>;
    fn revert(&self) -> Result<(), BridgeError>;
}

/// One bounded period of proxied access. Write-once; shared read-only across
/// every connection handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySession {
    pub token: String,
    pub reason: String,
    pub expires_at: SystemTime,
    pub bind: SocketAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownTrigger {
    Expired,
    Interrupted,
}

impl ShutdownTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::Interrupted => "interrupted",
        }
    }
}

#[derive(Debug)]
pub struct SessionOutcome {
    pub trigger: ShutdownTrigger,
    pub summary: ServerRunSummary,
    pub drain_timed_out: bool,
    /// A failed revert is surfaced here rather than as an error: the session
    /// itself ended as requested, but the operator has cleanup to do.
    pub revert_error: Option<BridgeError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    Starting,
    Active,
    Draining,
    Terminated,
}

impl SessionState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Terminated => "terminated",
        }
    }
}

/// Owns the proxy's lifetime: binds it, points the client at it, races the
/// credential expiry against an interrupt signal, and tears everything down.
///
/// The controller is signal-agnostic; the interrupt arrives on a generic
/// watch channel that the binary wires to ctrl-c.
pub struct SessionController {
    config: ProxyConfig,
    store: Arc<CertificateStore>,
    state: SessionState,
}

impl SessionController {
    pub fn new(config: ProxyConfig, store: Arc<CertificateStore>) -> Result<Self, ProxyError> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            state: SessionState::Idle,
        })
    }

    pub async fn run<B: ClientConfigBridge>(
        mut self,
        credential: AccessCredential,
        reason: String,
        bridge: B,
        interrupt: watch::Receiver<bool>,
    ) -> Result<SessionOutcome, SessionError> {
        self.transition(SessionState::Starting);
        let time_to_expiry = credential
            .expires_at
            .duration_since(SystemTime::now())
            .map_err(|_| SessionError::CredentialExpired)?;

        let session = Arc::new(ProxySession {
            token: credential.bearer_token,
            reason,
            expires_at: credential.expires_at,
            bind: self.config.bind,
        });

        let request_log = match &self.config.request_log_path {
            Some(path) => Some(Arc::new(RequestLog::create(path).map_err(ProxyError::Io)?)),
            None => None,
        };

        let proxy = InterceptingProxy::new(
            &self.config,
            Arc::clone(&session),
            Arc::clone(&self.store),
            request_log,
        )?;
        let listener = proxy.bind().await?;
        let proxy_addr = listener.local_addr().map_err(ProxyError::Io)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(proxy.run(listener, shutdown_rx));

        // The listener is accepting; from here on the client configuration
        // may have been touched, so revert exactly once on every exit path.
        let point_result = bridge.point_at_proxy(proxy_addr, &self.config.ca.cert_path);
        let run_result = match point_result {
            Ok(()) => {
                self.transition(SessionState::Active);
                tracing::info!(
                    proxy = %proxy_addr,
                    expires_in_secs = time_to_expiry.as_secs(),
                    "session active"
                );
                let trigger = self.await_shutdown_trigger(time_to_expiry, interrupt).await;
                self.transition(SessionState::Draining);
                let (summary, drain_timed_out) = self.drain(&shutdown_tx, server).await;
                Ok((trigger, summary, drain_timed_out))
            }
            Err(error) => {
                tracing::error!(%error, "failed to point client configuration at proxy");
                self.transition(SessionState::Draining);
                let (_, _) = self.drain(&shutdown_tx, server).await;
                Err(error)
            }
        };

        let revert_error = bridge.revert().err();
        self.transition(SessionState::Terminated);

        let metrics = self.store.metrics_snapshot();
        tracing::info!(
            leaves_issued = metrics.leaves_issued,
            cache_hits = metrics.cache_hits,
            "certificate store totals at session end"
        );

        match run_result {
            Ok((trigger, summary, drain_timed_out)) => {
                tracing::info!(trigger = trigger.as_str(), "session ended");
                Ok(SessionOutcome {
                    trigger,
                    summary,
                    drain_timed_out,
                    revert_error,
                })
            }
            Err(point_error) => {
                if let Some(revert_error) = revert_error {
                    tracing::error!(%revert_error, "revert after failed startup also failed");
                }
                Err(SessionError::Bridge(point_error))
            }
        }
    }

    /// Races the wall-clock expiry deadline against the interrupt signal.
    /// Whichever fires first wins; both produce identical cleanup, the only
    /// difference is the log line.
    async fn await_shutdown_trigger(
        &self,
        time_to_expiry: Duration,
        mut interrupt: watch::Receiver<bool>,
    ) -> ShutdownTrigger {
        let expiry = tokio::time::sleep(time_to_expiry);
        tokio::pin!(expiry);

        loop {
            tokio::select! {
                _ = &mut expiry => {
                    tracing::info!("credential expiry reached");
                    return ShutdownTrigger::Expired;
                }
                changed = interrupt.changed() => match changed {
                    Ok(()) if *interrupt.borrow() => {
                        tracing::info!("interrupt received");
                        return ShutdownTrigger::Interrupted;
                    }
                    Ok(()) => continue,
                    Err(_) => {
                        // Interrupt source is gone; only expiry can end the
                        // session now.
                        expiry.as_mut().await;
                        tracing::info!("credential expiry reached");
                        return ShutdownTrigger::Expired;
                    }
                },
            }
        }
    }

    async fn drain(
        &self,
        shutdown_tx: &watch::Sender<bool>,
        mut server: JoinHandle<std::io::Result<ServerRunSummary>>,
    ) -> (ServerRunSummary, bool) {
        let _ = shutdown_tx.send(true);

        let budget = self.config.drain_timeout + DRAIN_SLACK;
        match tokio::time::timeout(budget, &mut server).await {
            Ok(Ok(Ok(summary))) => (summary, false),
            Ok(Ok(Err(error))) => {
                tracing::warn!(%error, "proxy server ended with error");
                (ServerRunSummary::default(), false)
            }
            Ok(Err(join_error)) => {
                tracing::warn!(%join_error, "proxy server task failed");
                (ServerRunSummary::default(), false)
            }
            Err(_) => {
                tracing::warn!("proxy server did not stop within the drain budget");
                server.abort();
                (ServerRunSummary::default(), true)
            }
        }
    }

    fn transition(&mut self, next: SessionState) {
        tracing::debug!(from = self.state.as_str(), to = next.as_str(), "session state");
        self.state = next;
    }
}
