use std::io;
use std::sync::Arc;
use std::time::Duration;

use keyhole_tls::CertificateStore;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::ProxyConfig;
use crate::connect::{parse_connect_request_head, read_connect_head};
use crate::errors::ProxyError;
use crate::headers::HeaderInjector;
use crate::http1::{
    parse_http_request_head, parse_http_response_head, read_until_pattern, relay_http_body,
    write_proxy_response, BufferedConn,
};
use crate::request_log::{RequestLog, RequestRecord};
use crate::session::ProxySession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerRunSummary {
    pub accepted_connections: u64,
    pub completed_connections: u64,
    pub failed_connections: u64,
}

/// The MITM server for one session: terminates client TLS with forged
/// per-host certificates, injects the session credential into every
/// decrypted request, and relays responses unmodified.
pub struct InterceptingProxy {
    session: Arc<ProxySession>,
    store: Arc<CertificateStore>,
    injector: Arc<HeaderInjector>,
    upstream_tls: Arc<ClientConfig>,
    request_log: Option<Arc<RequestLog>>,
    max_connect_head_bytes: usize,
    max_http_head_bytes: usize,
    drain_timeout: Duration,
}

#[derive(Clone)]
struct ConnectionContext {
    store: Arc<CertificateStore>,
    injector: Arc<HeaderInjector>,
    upstream_tls: Arc<ClientConfig>,
    request_log: Option<Arc<RequestLog>>,
    max_connect_head_bytes: usize,
    max_http_head_bytes: usize,
}

impl InterceptingProxy {
    pub fn new(
        config: &ProxyConfig,
        session: Arc<ProxySession>,
        store: Arc<CertificateStore>,
        request_log: Option<Arc<RequestLog>>,
    ) -> Result<Self, ProxyError> {
        config.validate()?;
        let injector = Arc::new(HeaderInjector::new(&session.token, &session.reason)?);
        Ok(Self {
            session,
            store,
            injector,
            upstream_tls: keyhole_tls::build_upstream_client_config(config.verify_upstream_tls),
            request_log,
            max_connect_head_bytes: config.max_connect_head_bytes,
            max_http_head_bytes: config.max_http_head_bytes,
            drain_timeout: config.drain_timeout,
        })
    }

    pub async fn bind(&self) -> Result<TcpListener, ProxyError> {
        TcpListener::bind(self.session.bind)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: self.session.bind,
                source,
            })
    }

    /// Serves CONNECT requests until the shutdown signal flips, then drains
    /// in-flight connections bounded by the configured grace period.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> io::Result<ServerRunSummary> {
        let mut summary = ServerRunSummary::default();
        if *shutdown_rx.borrow() {
            return Ok(summary);
        }

        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer_addr) = accepted?;
                    summary.accepted_connections += 1;
                    let context = ConnectionContext {
                        store: Arc::clone(&self.store),
                        injector: Arc::clone(&self.injector),
                        upstream_tls: Arc::clone(&self.upstream_tls),
                        request_log: self.request_log.clone(),
                        max_connect_head_bytes: self.max_connect_head_bytes,
                        max_http_head_bytes: self.max_http_head_bytes,
                    };
                    tasks.spawn(async move {
                        let client_addr = peer_addr.to_string();
                        let result = handle_client(context, stream, client_addr.clone()).await;
                        if let Err(error) = &result {
                            tracing::debug!(client = %client_addr, %error, "connection handling failed");
                        }
                        result
                    });
                }
                _ = shutdown_rx.changed() => break,
            }
        }

        // Stop accepting immediately; in-flight connections get the grace
        // period, then whatever remains is aborted.
        drop(listener);
        let deadline = Instant::now() + self.drain_timeout;
        loop {
            let joined = tokio::time::timeout_at(deadline, tasks.join_next()).await;
            match joined {
                Ok(Some(Ok(Ok(())))) => summary.completed_connections += 1,
                Ok(Some(Ok(Err(error)))) => {
                    summary.failed_connections += 1;
                    tracing::debug!(%error, "connection ended with error during drain");
                }
                Ok(Some(Err(_))) => summary.failed_connections += 1,
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        remaining = tasks.len(),
                        "drain timeout elapsed; aborting in-flight connections"
                    );
                    tasks.abort_all();
                    while let Some(result) = tasks.join_next().await {
                        if !matches!(result, Ok(Ok(()))) {
                            summary.failed_connections += 1;
                        } else {
                            summary.completed_connections += 1;
                        }
                    }
                    break;
                }
            }
        }

        Ok(summary)
    }
}

async fn handle_client(
    context: ConnectionContext,
    mut downstream: TcpStream,
    client_addr: String,
) -> io::Result<()> {
    let head = match read_connect_head(&mut downstream, context.max_connect_head_bytes).await {
        Ok(head) => head,
        Err(error) => {
            tracing::debug!(client = %client_addr, %error, "CONNECT head read failed");
            if error.kind() != io::ErrorKind::UnexpectedEof {
                let status = if error.kind() == io::ErrorKind::InvalidData {
                    "431 Request Header Fields Too Large"
                } else {
                    "400 Bad Request"
                };
                write_proxy_response(
                    &mut downstream,
                    status,
                    "invalid or incomplete CONNECT request",
                )
                .await?;
            }
            return Ok(());
        }
    };

    let connect = match parse_connect_request_head(&head) {
        Ok((connect, _header_len)) => connect,
        Err(parse_error) => {
            tracing::debug!(
                client = %client_addr,
                code = parse_error.code(),
                "CONNECT parse failed"
            );
            write_proxy_response(&mut downstream, "400 Bad Request", "invalid CONNECT request")
                .await?;
            return Ok(());
        }
    };

    // Every CONNECT is terminated locally; there is no tunnel fallback,
    // because credential injection needs the decrypted request.
    let issued = match context
        .store
        .server_config_for(&connect.server_host, connect.server_port)
    {
        Ok(issued) => issued,
        Err(error) => {
            tracing::warn!(
                host = %connect.server_host,
                port = connect.server_port,
                %error,
                "leaf certificate issuance failed"
            );
            write_proxy_response(
                &mut downstream,
                "502 Bad Gateway",
                "certificate issuance for requested host failed",
            )
            .await?;
            return Ok(());
        }
    };
    tracing::debug!(
        host = %connect.server_host,
        port = connect.server_port,
        cache = issued.cache_status.as_str(),
        "leaf certificate ready"
    );

    let upstream_tcp =
        match TcpStream::connect((connect.server_host.as_str(), connect.server_port)).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::debug!(
                    host = %connect.server_host,
                    port = connect.server_port,
                    %error,
                    "upstream connect failed"
                );
                write_proxy_response(
                    &mut downstream,
                    "502 Bad Gateway",
                    &format!("upstream connect failed: {error}"),
                )
                .await?;
                return Ok(());
            }
        };

    downstream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;

    let acceptor = TlsAcceptor::from(issued.server_config);
    let downstream_tls = match acceptor.accept(downstream).await {
        Ok(stream) => stream,
        Err(error) => {
            tracing::debug!(
                host = %connect.server_host,
                %error,
                "downstream TLS handshake failed"
            );
            return Ok(());
        }
    };

    let server_name = match ServerName::try_from(connect.server_host.clone()) {
        Ok(name) => name,
        Err(_) => {
            tracing::debug!(host = %connect.server_host, "invalid server name for upstream TLS");
            return Ok(());
        }
    };
    let connector = TlsConnector::from(Arc::clone(&context.upstream_tls));
    let upstream_tls = match connector.connect(server_name, upstream_tcp).await {
        Ok(stream) => stream,
        Err(error) => {
            tracing::warn!(
                host = %connect.server_host,
                %error,
                "upstream TLS handshake failed"
            );
            return Ok(());
        }
    };

    intercept_loop(context, connect.server_host, connect.server_port, downstream_tls, upstream_tls)
        .await
}

async fn intercept_loop(
    context: ConnectionContext,
    server_host: String,
    server_port: u16,
    downstream_tls: tokio_rustls::server::TlsStream<TcpStream>,
    upstream_tls: tokio_rustls::client::TlsStream<TcpStream>,
) -> io::Result<()> {
    let mut downstream_conn = BufferedConn::new(downstream_tls);
    let mut upstream_conn = BufferedConn::new(upstream_tls);

    loop {
        let request_raw = match read_until_pattern(
            &mut downstream_conn,
            b"\r\n\r\n",
            context.max_http_head_bytes,
        )
        .await?
        {
            Some(raw) => raw,
            None => return Ok(()),
        };

        let request = parse_http_request_head(&request_raw)?;
        let rewritten_head = context.injector.rewrite_head(&request)?;
        upstream_conn.stream.write_all(&rewritten_head).await?;

        relay_http_body(
            &mut downstream_conn,
            &mut upstream_conn.stream,
            request.body_mode,
            context.max_http_head_bytes,
        )
        .await?;
        upstream_conn.stream.flush().await?;

        let response_raw = match read_until_pattern(
            &mut upstream_conn,
            b"\r\n\r\n",
            context.max_http_head_bytes,
        )
        .await?
        {
            Some(raw) => raw,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "upstream closed before response headers",
                ));
            }
        };

        let response = parse_http_response_head(&response_raw, &request.method)?;
        downstream_conn.stream.write_all(&response.raw).await?;

        let response_bytes = relay_http_body(
            &mut upstream_conn,
            &mut downstream_conn.stream,
            response.body_mode,
            context.max_http_head_bytes,
        )
        .await?;
        downstream_conn.stream.flush().await?;

        tracing::debug!(
            host = %server_host,
            method = %request.method,
            target = %request.target,
            status = response.status_code,
            response_bytes,
            "request proxied"
        );
        if let Some(log) = &context.request_log {
            log.record(&RequestRecord::new(
                &server_host,
                server_port,
                &request.method,
                &request.target,
                response.status_code,
            ));
        }

        if request.connection_close || response.connection_close {
            let _ = downstream_conn.stream.shutdown().await;
            return Ok(());
        }
    }
}
