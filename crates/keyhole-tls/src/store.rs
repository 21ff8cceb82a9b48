use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use time::{Duration, OffsetDateTime};

use crate::authority::CaMaterial;
use crate::TlsError;

const LEAF_VALIDITY_DAYS: i64 = 365;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafCacheStatus {
    Hit,
    Miss,
}

impl LeafCacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
        }
    }
}

#[derive(Debug, Clone)]
pub struct IssuedLeaf {
    pub server_config: Arc<ServerConfig>,
    pub cache_status: LeafCacheStatus,
    pub leaf_cert_der: CertificateDer<'static>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreMetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub leaves_issued: u64,
}

struct CachedLeaf {
    server_config: Arc<ServerConfig>,
    leaf_cert_der: CertificateDer<'static>,
}

/// Per-host leaf certificate store backed by the session's root authority.
///
/// The cache is keyed by `host:port` and guarded by a single mutex spanning
/// the lookup and the insert, so concurrent connections to a brand-new host
/// serialize on the first signing and every later connection reuses it.
/// Entries are never evicted; the store lives only as long as one session.
pub struct CertificateStore {
    ca: CaMaterial,
    leaf_cache: Mutex<HashMap<String, CachedLeaf>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    leaves_issued: AtomicU64,
}

impl CertificateStore {
    pub fn new(ca: CaMaterial) -> Self {
        Self {
            ca,
            leaf_cache: Mutex::new(HashMap::new()),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            leaves_issued: AtomicU64::new(0),
        }
    }

    pub fn ca_certificate_pem(&self) -> &str {
        &self.ca.cert_pem
    }

    pub fn ca_certificate_der(&self) -> &CertificateDer<'static> {
        &self.ca.cert_der
    }

    /// Returns the server-side TLS config for `host:port`, signing a fresh
    /// leaf on first sight of the pair. Exactly one certificate is ever
    /// signed per distinct key within a process lifetime.
    pub fn server_config_for(&self, host: &str, port: u16) -> Result<IssuedLeaf, TlsError> {
        let normalized_host = normalize_host(host);
        let cache_key = format!("{normalized_host}:{port}");

        let mut cache = self.leaf_cache.lock().map_err(|_| TlsError::LockPoisoned)?;
        if let Some(cached) = cache.get(&cache_key) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(IssuedLeaf {
                server_config: Arc::clone(&cached.server_config),
                cache_status: LeafCacheStatus::Hit,
                leaf_cert_der: cached.leaf_cert_der.clone(),
            });
        }

        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        let (server_config, leaf_cert_der) = issue_leaf_server_config(&self.ca, &normalized_host)?;
        self.leaves_issued.fetch_add(1, Ordering::Relaxed);

        cache.insert(
            cache_key,
            CachedLeaf {
                server_config: Arc::clone(&server_config),
                leaf_cert_der: leaf_cert_der.clone(),
            },
        );

        Ok(IssuedLeaf {
            server_config,
            cache_status: LeafCacheStatus::Miss,
            leaf_cert_der,
        })
    }

    pub fn metrics_snapshot(&self) -> StoreMetricsSnapshot {
        StoreMetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            leaves_issued: self.leaves_issued.load(Ordering::Relaxed),
        }
    }
}

fn issue_leaf_server_config(
    ca: &CaMaterial,
    host: &str,
) -> Result<(Arc<ServerConfig>, CertificateDer<'static>), TlsError> {
    let leaf_params = build_leaf_params(host)?;
    let leaf_key = KeyPair::generate()?;
    let leaf_key_der = PrivatePkcs8KeyDer::from(leaf_key.serialize_der());
    let leaf_cert = leaf_params.signed_by(&leaf_key, &ca.issuer)?;
    let leaf_cert_der = leaf_cert.der().clone();

    let chain = vec![leaf_cert_der.clone(), ca.cert_der.clone()];
    let private_key = PrivateKeyDer::from(leaf_key_der);

    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, private_key)?;
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok((Arc::new(server_config), leaf_cert_der))
}

fn build_leaf_params(host: &str) -> Result<CertificateParams, TlsError> {
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.use_authority_key_identifier_extension = true;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, host.to_string());
    params.distinguished_name = distinguished_name;

    // SAN carries either a DNS name or an IP address, never both.
    if let Ok(ip) = host.parse::<IpAddr>() {
        params.subject_alt_names.push(SanType::IpAddress(ip));
    } else {
        params
            .subject_alt_names
            .push(SanType::DnsName(host.try_into().map_err(|error| {
                TlsError::InvalidMaterial(format!("invalid leaf DNS name `{host}`: {error}"))
            })?));
    }

    Ok(params)
}

fn normalize_host(host: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(_) => host.to_string(),
        Err(_) => host.to_ascii_lowercase(),
    }
}

/// Client config for the upstream leg of an intercepted connection.
pub fn build_upstream_client_config(verify_upstream_tls: bool) -> Arc<ClientConfig> {
    let mut config = if verify_upstream_tls {
        let root_store = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth()
    } else {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureSkipVerifyServerCertVerifier))
            .with_no_client_auth()
    };

    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

#[derive(Debug)]
struct InsecureSkipVerifyServerCertVerifier;

impl ServerCertVerifier for InsecureSkipVerifyServerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
        ]
    }
}
