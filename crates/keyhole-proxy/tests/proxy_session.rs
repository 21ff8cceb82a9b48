use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use keyhole_proxy::{
    AccessCredential, BridgeError, ClientConfigBridge, ProxyConfig, SessionController,
    SessionError, ShutdownTrigger,
};
use keyhole_tls::{ensure_valid, CaPaths, CertificateStore, ToolVersion};
use rcgen::{CertificateParams, KeyPair, SanType};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::{TlsAcceptor, TlsConnector};

#[derive(Clone, Default)]
struct MockBridge {
    points: Arc<AtomicUsize>,
    reverts: Arc<AtomicUsize>,
    pointed_at: Arc<Mutex<Option<SocketAddr>>>,
    fail_point: bool,
}

impl MockBridge {
    fn failing_point() -> Self {
        Self {
            fail_point: true,
            ..Self::default()
        }
    }

    fn reverts(&self) -> usize {
        self.reverts.load(Ordering::SeqCst)
    }

    fn points(&self) -> usize {
        self.points.load(Ordering::SeqCst)
    }

    fn pointed_addr(&self) -> Option<SocketAddr> {
        *self.pointed_at.lock().expect("pointed_at lock")
    }
}

impl ClientConfigBridge for MockBridge {
    fn point_at_proxy(
        &self,
        proxy_addr: SocketAddr,
        _ca_cert_path: &Path,
    ) -> Result<(), BridgeError> {
        self.points.fetch_add(1, Ordering::SeqCst);
        if self.fail_point {
            return Err(BridgeError::CommandFailed {
                status: 1,
                detail: "forced point failure".to_string(),
            });
        }
        *self.pointed_at.lock().expect("pointed_at lock") = Some(proxy_addr);
        Ok(())
    }

    fn revert(&self) -> Result<(), BridgeError> {
        self.reverts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct SessionFixture {
    controller: SessionController,
    ca_pem: String,
}

fn session_fixture(ca_dir: &Path) -> SessionFixture {
    let ensured =
        ensure_valid(&CaPaths::in_dir(ca_dir), ToolVersion::new(1, 0, 0)).expect("session ca");
    let ca_pem = ensured.material.cert_pem.clone();
    let store = Arc::new(CertificateStore::new(ensured.material));

    let config = ProxyConfig {
        bind: "127.0.0.1:0".parse().expect("bind addr"),
        ca: CaPaths::in_dir(ca_dir),
        drain_timeout: Duration::from_secs(1),
        verify_upstream_tls: false,
        ..ProxyConfig::default()
    };
    let controller = SessionController::new(config, store).expect("controller");
    SessionFixture { controller, ca_pem }
}

fn credential(token: &str, valid_for: Duration) -> AccessCredential {
    AccessCredential {
        bearer_token: token.to_string(),
        expires_at: SystemTime::now() + valid_for,
    }
}

/// Minimal HTTPS origin that answers every request by echoing the request
/// head it received back in the response body.
async fn spawn_tls_echo_server() -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let key = KeyPair::generate().expect("echo key");
    let mut params = CertificateParams::new(Vec::<String>::new()).expect("echo params");
    params
        .subject_alt_names
        .push(SanType::IpAddress("127.0.0.1".parse().expect("loopback ip")));
    let cert = params.self_signed(&key).expect("echo cert");

    let chain = vec![cert.der().clone()];
    let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key.serialize_der()));
    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key_der)
        .expect("echo server config");
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("echo bind");
    let addr = listener.local_addr().expect("echo addr");

    let handle = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(stream).await else {
                    return;
                };
                let mut head = Vec::new();
                let mut chunk = [0_u8; 1024];
                while !head.windows(4).any(|window| window == b"\r\n\r\n") {
                    let Ok(read) = tls.read(&mut chunk).await else {
                        return;
                    };
                    if read == 0 {
                        return;
                    }
                    head.extend_from_slice(&chunk[..read]);
                }
                let body = String::from_utf8_lossy(&head).to_string();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = tls.write_all(response.as_bytes()).await;
                let _ = tls.shutdown().await;
            });
        }
    });

    (addr, handle)
}

async fn wait_for_pointed_addr(bridge: &MockBridge) -> SocketAddr {
    for _ in 0..500 {
        if let Some(addr) = bridge.pointed_addr() {
            return addr;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session never reported its proxy address");
}

/// CONNECTs through the proxy, completes TLS against the forged leaf using
/// the session CA as the only trust root, sends one request carrying a
/// user-supplied Authorization header, and returns the echoed response.
async fn request_via_proxy(
    proxy_addr: SocketAddr,
    upstream_addr: SocketAddr,
    ca_pem: &str,
) -> String {
    let mut tcp = TcpStream::connect(proxy_addr).await.expect("proxy connect");
    let connect_head = format!(
        "CONNECT 127.0.0.1:{port} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n",
        port = upstream_addr.port()
    );
    tcp.write_all(connect_head.as_bytes())
        .await
        .expect("send CONNECT");

    let mut response_head = Vec::new();
    let mut byte = [0_u8; 1];
    while !response_head.windows(4).any(|window| window == b"\r\n\r\n") {
        let read = tcp.read(&mut byte).await.expect("read CONNECT response");
        assert_ne!(read, 0, "proxy closed before CONNECT response completed");
        response_head.push(byte[0]);
    }
    let response_head = String::from_utf8_lossy(&response_head).to_string();
    assert!(
        response_head.starts_with("HTTP/1.1 200"),
        "unexpected CONNECT response: {response_head}"
    );

    let mut roots = RootCertStore::empty();
    let ca_der = CertificateDer::from_pem_slice(ca_pem.as_bytes()).expect("session ca der");
    roots.add(ca_der).expect("add session ca");
    let client_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(client_config));
    let server_name = ServerName::try_from("127.0.0.1".to_string()).expect("server name");
    let mut tls = connector
        .connect(server_name, tcp)
        .await
        .expect("TLS through proxy");

    tls.write_all(
        b"GET /echo HTTP/1.1\r\nHost: 127.0.0.1\r\nAuthorization: Bearer original-user\r\nConnection: close\r\n\r\n",
    )
    .await
    .expect("send request");

    let mut response = Vec::new();
    let mut chunk = [0_u8; 1024];
    loop {
        match tls.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(read) => response.extend_from_slice(&chunk[..read]),
        }
    }
    String::from_utf8_lossy(&response).to_string()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn end_to_end_session_injects_credential_and_expires() {
    let ca_dir = tempfile::tempdir().expect("ca dir");
    let (upstream_addr, _echo) = spawn_tls_echo_server().await;
    let fixture = session_fixture(ca_dir.path());
    let bridge = MockBridge::default();
    let (_interrupt_tx, interrupt_rx) = watch::channel(false);

    let session = tokio::spawn(fixture.controller.run(
        credential("tok-123", Duration::from_secs(2)),
        "test".to_string(),
        bridge.clone(),
        interrupt_rx,
    ));

    let proxy_addr = wait_for_pointed_addr(&bridge).await;
    let echoed = request_via_proxy(proxy_addr, upstream_addr, &fixture.ca_pem).await;
    assert!(
        echoed.contains("authorization: Bearer tok-123"),
        "echoed request must carry the session token: {echoed}"
    );
    assert!(
        !echoed.contains("original-user"),
        "client-supplied Authorization must be overwritten: {echoed}"
    );
    assert!(
        echoed.contains("x-goog-request-reason: test"),
        "echoed request must carry the audit reason: {echoed}"
    );

    let outcome = tokio::time::timeout(Duration::from_secs(10), session)
        .await
        .expect("session must end at credential expiry")
        .expect("session task join")
        .expect("session outcome");
    assert_eq!(outcome.trigger, ShutdownTrigger::Expired);
    assert_eq!(bridge.points(), 1);
    assert_eq!(bridge.reverts(), 1);
    assert!(outcome.summary.accepted_connections >= 1);

    assert!(
        TcpStream::connect(proxy_addr).await.is_err(),
        "listener must refuse connections after the session ends"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interrupt_before_expiry_reverts_exactly_once() {
    let ca_dir = tempfile::tempdir().expect("ca dir");
    let fixture = session_fixture(ca_dir.path());
    let bridge = MockBridge::default();
    let (interrupt_tx, interrupt_rx) = watch::channel(false);

    let started_at = std::time::Instant::now();
    let session = fixture.controller.run(
        credential("tok-123", Duration::from_secs(60)),
        "test".to_string(),
        bridge.clone(),
        interrupt_rx,
    );
    let interrupter = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        interrupt_tx.send(true).expect("send interrupt");
    };

    let (outcome, ()) = tokio::join!(session, interrupter);
    let outcome = outcome.expect("session outcome");
    assert_eq!(outcome.trigger, ShutdownTrigger::Interrupted);
    assert_eq!(bridge.reverts(), 1);
    assert!(
        started_at.elapsed() < Duration::from_secs(30),
        "interrupt must end the session well before expiry"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn near_simultaneous_expiry_and_interrupt_revert_once() {
    let ca_dir = tempfile::tempdir().expect("ca dir");
    let fixture = session_fixture(ca_dir.path());
    let bridge = MockBridge::default();
    let (interrupt_tx, interrupt_rx) = watch::channel(false);

    let session = fixture.controller.run(
        credential("tok-123", Duration::from_millis(250)),
        "test".to_string(),
        bridge.clone(),
        interrupt_rx,
    );
    let interrupter = async {
        tokio::time::sleep(Duration::from_millis(250)).await;
        let _ = interrupt_tx.send(true);
    };

    let (outcome, ()) = tokio::join!(session, interrupter);
    let outcome = outcome.expect("session outcome");
    assert_eq!(bridge.reverts(), 1, "shutdown must be idempotent");
    assert!(matches!(
        outcome.trigger,
        ShutdownTrigger::Expired | ShutdownTrigger::Interrupted
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_point_at_proxy_still_reverts() {
    let ca_dir = tempfile::tempdir().expect("ca dir");
    let fixture = session_fixture(ca_dir.path());
    let bridge = MockBridge::failing_point();
    let (_interrupt_tx, interrupt_rx) = watch::channel(false);

    let result = fixture
        .controller
        .run(
            credential("tok-123", Duration::from_secs(60)),
            "test".to_string(),
            bridge.clone(),
            interrupt_rx,
        )
        .await;

    assert!(matches!(result, Err(SessionError::Bridge(_))));
    assert_eq!(bridge.points(), 1);
    assert_eq!(
        bridge.reverts(),
        1,
        "revert must run even when pointing the client failed"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expired_credential_is_rejected_before_any_config_change() {
    let ca_dir = tempfile::tempdir().expect("ca dir");
    let fixture = session_fixture(ca_dir.path());
    let bridge = MockBridge::default();
    let (_interrupt_tx, interrupt_rx) = watch::channel(false);

    let expired = AccessCredential {
        bearer_token: "tok-123".to_string(),
        expires_at: SystemTime::now() - Duration::from_secs(1),
    };
    let result = fixture
        .controller
        .run(expired, "test".to_string(), bridge.clone(), interrupt_rx)
        .await;

    assert!(matches!(result, Err(SessionError::CredentialExpired)));
    assert_eq!(bridge.points(), 0);
    assert_eq!(bridge.reverts(), 0);
}
