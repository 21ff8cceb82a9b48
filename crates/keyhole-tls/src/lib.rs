use std::error::Error as StdError;
use std::fmt;
use std::path::{Path, PathBuf};

mod authority;
mod store;

pub use authority::{ensure_valid, CaMaterial, CaOrigin, EnsuredCa, RegenerationReason};
pub use store::{
    build_upstream_client_config, CertificateStore, IssuedLeaf, LeafCacheStatus,
    StoreMetricsSnapshot,
};

/// Subject common name prefix for the root certificate. The running tool
/// version is appended so stale authorities can be detected and rotated.
pub const CA_COMMON_NAME_PREFIX: &str = "keyhole proxy CA v";

const CA_ORGANIZATION: &str = "keyhole";

#[derive(Debug)]
pub enum TlsError {
    CertificateGeneration(rcgen::Error),
    ConfigBuild(rustls::Error),
    Io(std::io::Error),
    LockPoisoned,
    InvalidMaterial(String),
}

impl fmt::Display for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CertificateGeneration(error) => {
                write!(f, "certificate generation failed: {error}")
            }
            Self::ConfigBuild(error) => write!(f, "TLS config build failed: {error}"),
            Self::Io(error) => write!(f, "I/O error: {error}"),
            Self::LockPoisoned => write!(f, "certificate store lock poisoned"),
            Self::InvalidMaterial(reason) => write!(f, "invalid certificate material: {reason}"),
        }
    }
}

impl StdError for TlsError {}

impl From<rcgen::Error> for TlsError {
    fn from(value: rcgen::Error) -> Self {
        Self::CertificateGeneration(value)
    }
}

impl From<rustls::Error> for TlsError {
    fn from(value: rustls::Error) -> Self {
        Self::ConfigBuild(value)
    }
}

impl From<std::io::Error> for TlsError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Locations of the persisted root certificate and private key PEM files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaPaths {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl CaPaths {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self {
            cert_path: dir.join("keyhole-ca.pem"),
            key_path: dir.join("keyhole-ca-key.pem"),
        }
    }
}

/// Semantic version embedded in the root certificate's common name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ToolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ToolVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// The version this crate was built as.
    pub fn current() -> Self {
        Self::parse(env!("CARGO_PKG_VERSION")).expect("crate version must be a semver triple")
    }

    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            major,
            minor,
            patch,
        })
    }
}

impl fmt::Display for ToolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

pub(crate) fn ca_common_name(version: ToolVersion) -> String {
    format!("{CA_COMMON_NAME_PREFIX}{version}")
}

pub(crate) fn parse_ca_common_name(common_name: &str) -> Option<ToolVersion> {
    let version_text = common_name.strip_prefix(CA_COMMON_NAME_PREFIX)?;
    ToolVersion::parse(version_text)
}
