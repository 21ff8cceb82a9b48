use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use clap::Parser;
use keyhole_proxy::{
    AccessCredential, BridgeError, ClientConfigBridge, CredentialError, CredentialSource,
    ProxyConfig, SessionController,
};
use keyhole_tls::{CaOrigin, CaPaths, CertificateStore, ToolVersion};
use serde::Deserialize;
use tokio::sync::watch;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Temporary, audited cloud API access through a credential-injecting local
/// proxy. The proxy runs for exactly as long as the issued token is valid.
#[derive(Debug, Parser)]
#[command(name = "keyhole", version)]
struct Cli {
    /// Identity to impersonate; handed to the credential helper verbatim.
    #[arg(long)]
    target_identity: String,

    /// Audit reason attached to every proxied request.
    #[arg(long)]
    reason: String,

    /// Helper command printing `{"token": "...", "expiry_unix": <secs>}`.
    /// The target identity and reason are appended as arguments.
    #[arg(long, value_name = "CMD")]
    credential_cmd: String,

    /// Command pointing the client tool at the proxy; the proxy address,
    /// port, and CA certificate path are appended as arguments. Without it,
    /// configure the client manually.
    #[arg(long, value_name = "CMD")]
    point_cmd: Option<String>,

    /// Command reverting the client tool's proxy configuration.
    #[arg(long, value_name = "CMD")]
    revert_cmd: Option<String>,

    /// Address the proxy listens on.
    #[arg(long, default_value = "127.0.0.1")]
    address: IpAddr,

    /// Port the proxy listens on; 0 picks an ephemeral port.
    #[arg(long, default_value_t = 8118)]
    port: u16,

    /// Directory holding the local CA certificate and key.
    #[arg(long, default_value = "./keyhole-ca")]
    ca_dir: PathBuf,

    /// Append a JSON line per proxied request to this file.
    #[arg(long)]
    request_log: Option<PathBuf>,

    /// Seconds in-flight connections get to finish at shutdown.
    #[arg(long, default_value_t = 5)]
    drain_timeout_secs: u64,

    /// Skip upstream certificate verification (testing only).
    #[arg(long)]
    insecure_upstream: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitClass {
    Ok,
    ConfigInvalid,
    CaInitFailed,
    CredentialFetchFailed,
    SessionFailed,
    RevertFailed,
}

impl ExitClass {
    fn code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::ConfigInvalid => 20,
            Self::CaInitFailed => 21,
            Self::CredentialFetchFailed => 22,
            Self::SessionFailed => 23,
            Self::RevertFailed => 24,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::ConfigInvalid => "config_invalid",
            Self::CaInitFailed => "ca_init_failed",
            Self::CredentialFetchFailed => "credential_fetch_failed",
            Self::SessionFailed => "session_failed",
            Self::RevertFailed => "revert_failed",
        }
    }
}

#[derive(Debug)]
struct RunOutcome {
    class: ExitClass,
    detail: Option<String>,
}

impl RunOutcome {
    fn ok() -> Self {
        Self {
            class: ExitClass::Ok,
            detail: None,
        }
    }

    fn error(class: ExitClass, detail: impl Into<String>) -> Self {
        Self {
            class,
            detail: Some(detail.into()),
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    let outcome = run(cli).await;
    match outcome.class {
        ExitClass::Ok => {}
        class => {
            let detail = outcome.detail.as_deref().unwrap_or("unknown failure");
            tracing::error!(class = class.label(), "{detail}");
        }
    }
    std::process::exit(outcome.class.code());
}

async fn run(cli: Cli) -> RunOutcome {
    let config = ProxyConfig {
        bind: SocketAddr::new(cli.address, cli.port),
        ca: CaPaths::in_dir(&cli.ca_dir),
        drain_timeout: Duration::from_secs(cli.drain_timeout_secs.max(1)),
        verify_upstream_tls: !cli.insecure_upstream,
        request_log_path: cli.request_log.clone(),
        ..ProxyConfig::default()
    };

    let ensured = match keyhole_tls::ensure_valid(&config.ca, ToolVersion::current()) {
        Ok(ensured) => ensured,
        Err(error) => return RunOutcome::error(ExitClass::CaInitFailed, error.to_string()),
    };
    match ensured.origin {
        CaOrigin::LoadedExisting => {
            tracing::debug!(cert = %config.ca.cert_path.display(), "reusing existing local CA");
        }
        CaOrigin::Generated(reason) => {
            tracing::info!(
                cert = %config.ca.cert_path.display(),
                reason = reason.code(),
                "generated local CA"
            );
        }
    }
    let store = Arc::new(CertificateStore::new(ensured.material));

    let credential_source = ExecCredentialSource {
        command: split_command(&cli.credential_cmd),
    };
    let credential = match credential_source.fetch(&cli.target_identity, &cli.reason) {
        Ok(credential) => credential,
        Err(error) => {
            return RunOutcome::error(ExitClass::CredentialFetchFailed, error.to_string())
        }
    };

    let bridge = CommandConfigBridge {
        point_command: cli.point_cmd.as_deref().map(split_command),
        revert_command: cli.revert_cmd.as_deref().map(split_command),
    };
    let revert_hint = bridge.manual_revert_hint();

    let controller = match SessionController::new(config, store) {
        Ok(controller) => controller,
        Err(error) => return RunOutcome::error(ExitClass::ConfigInvalid, error.to_string()),
    };

    let interrupt = spawn_interrupt_watcher();
    match controller
        .run(credential, cli.reason.clone(), bridge, interrupt)
        .await
    {
        Ok(outcome) => {
            tracing::info!(
                trigger = outcome.trigger.as_str(),
                accepted = outcome.summary.accepted_connections,
                completed = outcome.summary.completed_connections,
                failed = outcome.summary.failed_connections,
                "session terminated"
            );
            if let Some(revert_error) = outcome.revert_error {
                return RunOutcome::error(
                    ExitClass::RevertFailed,
                    format!(
                        "session ended but reverting the client configuration failed ({revert_error}); \
                         the client may still point at the dead proxy. {revert_hint}"
                    ),
                );
            }
            RunOutcome::ok()
        }
        Err(error) => RunOutcome::error(ExitClass::SessionFailed, error.to_string()),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn spawn_interrupt_watcher() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx.send(true);
        }
    });
    rx
}

fn split_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}

#[derive(Deserialize)]
struct HelperCredential {
    token: String,
    expiry_unix: u64,
}

/// Fetches the bearer token by running an external helper command.
struct ExecCredentialSource {
    command: Vec<String>,
}

impl CredentialSource for ExecCredentialSource {
    fn fetch(
        &self,
        target_identity: &str,
        reason: &str,
    ) -> Result<AccessCredential, CredentialError> {
        let (program, args) = self.command.split_first().ok_or_else(|| {
            CredentialError::InvalidOutput("credential command is empty".to_string())
        })?;
        let output = Command::new(program)
            .args(args)
            .arg(target_identity)
            .arg(reason)
            .output()?;
        if !output.status.success() {
            return Err(CredentialError::HelperFailed {
                status: output.status.code().unwrap_or(-1),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let parsed: HelperCredential = serde_json::from_slice(&output.stdout)
            .map_err(|error| CredentialError::InvalidOutput(error.to_string()))?;
        Ok(AccessCredential {
            bearer_token: parsed.token,
            expires_at: UNIX_EPOCH + Duration::from_secs(parsed.expiry_unix),
        })
    }
}

/// Points the client tool at the proxy by running configured commands.
/// Without commands it is a no-op that tells the operator what to do.
struct CommandConfigBridge {
    point_command: Option<Vec<String>>,
    revert_command: Option<Vec<String>>,
}

impl CommandConfigBridge {
    fn manual_revert_hint(&self) -> String {
        match &self.revert_command {
            Some(command) => format!("Run `{}` manually to clean up.", command.join(" ")),
            None => "Unset the client's proxy address, port, and custom CA manually.".to_string(),
        }
    }
}

impl ClientConfigBridge for CommandConfigBridge {
    fn point_at_proxy(
        &self,
        proxy_addr: SocketAddr,
        ca_cert_path: &Path,
    ) -> Result<(), BridgeError> {
        let Some(command) = &self.point_command else {
            tracing::warn!(
                proxy = %proxy_addr,
                ca_cert = %ca_cert_path.display(),
                "no point command configured; point the client at the proxy manually"
            );
            return Ok(());
        };
        run_bridge_command(
            command,
            &[
                proxy_addr.ip().to_string(),
                proxy_addr.port().to_string(),
                ca_cert_path.display().to_string(),
            ],
        )
    }

    fn revert(&self) -> Result<(), BridgeError> {
        let Some(command) = &self.revert_command else {
            tracing::warn!("no revert command configured; revert the client configuration manually");
            return Ok(());
        };
        run_bridge_command(command, &[])
    }
}

fn run_bridge_command(command: &[String], extra_args: &[String]) -> Result<(), BridgeError> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| BridgeError::CommandFailed {
            status: -1,
            detail: "bridge command is empty".to_string(),
        })?;
    let output = Command::new(program).args(args).args(extra_args).output()?;
    if !output.status.success() {
        return Err(BridgeError::CommandFailed {
            status: output.status.code().unwrap_or(-1),
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}
