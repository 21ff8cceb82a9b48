use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::CertificateDer;
use time::{Duration, OffsetDateTime};
use x509_parser::parse_x509_certificate;
use x509_parser::pem::parse_x509_pem;

use crate::{ca_common_name, parse_ca_common_name, CaPaths, TlsError, ToolVersion, CA_ORGANIZATION};

const CA_VALIDITY_DAYS: i64 = 365;

/// Root certificate material held in memory for the life of the process.
/// Read-only after `ensure_valid`; every leaf signing operation borrows it.
pub struct CaMaterial {
    pub(crate) issuer: Issuer<'static, KeyPair>,
    pub cert_pem: String,
    pub cert_der: CertificateDer<'static>,
    pub key_pem: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaOrigin {
    LoadedExisting,
    Generated(RegenerationReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegenerationReason {
    MissingFiles,
    MismatchedPair,
    UnparseableMaterial,
    WrongCommonName,
    StaleVersion,
    NotCertAuthority,
    KeyMismatch,
}

impl RegenerationReason {
    pub fn code(self) -> &'static str {
        match self {
            Self::MissingFiles => "missing_files",
            Self::MismatchedPair => "mismatched_pair",
            Self::UnparseableMaterial => "unparseable_material",
            Self::WrongCommonName => "wrong_common_name",
            Self::StaleVersion => "stale_version",
            Self::NotCertAuthority => "not_cert_authority",
            Self::KeyMismatch => "key_mismatch",
        }
    }
}

pub struct EnsuredCa {
    pub material: CaMaterial,
    pub origin: CaOrigin,
}

/// Loads the persisted root certificate if it is still trustworthy for the
/// running tool version, regenerating both PEM files otherwise.
///
/// Regeneration is all-or-nothing: the certificate and key are staged to
/// temporary files and renamed together, so a crash can never leave a
/// mismatched pair behind. Filesystem write failures are fatal; unreadable or
/// invalid existing material is treated as missing and healed in place.
pub fn ensure_valid(paths: &CaPaths, running: ToolVersion) -> Result<EnsuredCa, TlsError> {
    let cert_exists = paths.cert_path.exists();
    let key_exists = paths.key_path.exists();

    let reason = match (cert_exists, key_exists) {
        (true, true) => match load_existing(paths, running) {
            Ok(material) => {
                return Ok(EnsuredCa {
                    material,
                    origin: CaOrigin::LoadedExisting,
                })
            }
            Err(reason) => reason,
        },
        (false, false) => RegenerationReason::MissingFiles,
        _ => RegenerationReason::MismatchedPair,
    };

    let material = generate_material(running)?;
    persist_material(paths, &material)?;
    Ok(EnsuredCa {
        material,
        origin: CaOrigin::Generated(reason),
    })
}

fn load_existing(paths: &CaPaths, running: ToolVersion) -> Result<CaMaterial, RegenerationReason> {
    let cert_pem = fs::read_to_string(&paths.cert_path)
        .map_err(|_| RegenerationReason::UnparseableMaterial)?;
    let key_pem =
        fs::read_to_string(&paths.key_path).map_err(|_| RegenerationReason::UnparseableMaterial)?;

    let (_, pem) = parse_x509_pem(cert_pem.as_bytes())
        .map_err(|_| RegenerationReason::UnparseableMaterial)?;
    if pem.label != "CERTIFICATE" {
        return Err(RegenerationReason::UnparseableMaterial);
    }
    let (_, cert) =
        parse_x509_certificate(&pem.contents).map_err(|_| RegenerationReason::UnparseableMaterial)?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attribute| attribute.as_str().ok())
        .ok_or(RegenerationReason::WrongCommonName)?;
    let embedded = parse_ca_common_name(common_name).ok_or(RegenerationReason::WrongCommonName)?;
    if embedded < running {
        return Err(RegenerationReason::StaleVersion);
    }

    let is_ca = cert
        .basic_constraints()
        .ok()
        .flatten()
        .map(|extension| extension.value.ca)
        .unwrap_or(false);
    if !is_ca {
        return Err(RegenerationReason::NotCertAuthority);
    }

    let key = KeyPair::from_pem(&key_pem).map_err(|_| RegenerationReason::UnparseableMaterial)?;
    let cert_public_key = cert
        .tbs_certificate
        .subject_pki
        .subject_public_key
        .data
        .as_ref();
    if cert_public_key != key.public_key_raw() {
        return Err(RegenerationReason::KeyMismatch);
    }

    let cert_der = CertificateDer::from(pem.contents.clone());
    let issuer = Issuer::from_ca_cert_der(&cert_der, key)
        .map_err(|_| RegenerationReason::UnparseableMaterial)?;

    Ok(CaMaterial {
        issuer,
        cert_pem,
        cert_der,
        key_pem,
    })
}

fn generate_material(running: ToolVersion) -> Result<CaMaterial, TlsError> {
    let key = KeyPair::generate()?;
    let key_pem = key.serialize_pem();
    let params = build_ca_params(running);
    let cert = params.self_signed(&key)?;
    let cert_pem = cert.pem();
    let cert_der = cert.der().clone();
    let issuer = Issuer::new(params, key);

    Ok(CaMaterial {
        issuer,
        cert_pem,
        cert_der,
        key_pem,
    })
}

fn build_ca_params(running: ToolVersion) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ClientAuth,
        ExtendedKeyUsagePurpose::ServerAuth,
    ];

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, ca_common_name(running));
    distinguished_name.push(DnType::OrganizationName, CA_ORGANIZATION);
    params.distinguished_name = distinguished_name;
    params
}

fn persist_material(paths: &CaPaths, material: &CaMaterial) -> Result<(), TlsError> {
    ensure_parent_exists(&paths.cert_path)?;
    ensure_parent_exists(&paths.key_path)?;

    // Stage both files before renaming either, so no failure path leaves a
    // certificate paired with a key it does not match.
    let cert_staged = staged_path(&paths.cert_path);
    let key_staged = staged_path(&paths.key_path);
    write_staged(&cert_staged, material.cert_pem.as_bytes(), 0o644)?;
    if let Err(error) = write_staged(&key_staged, material.key_pem.as_bytes(), 0o600) {
        let _ = fs::remove_file(&cert_staged);
        return Err(error);
    }

    fs::rename(&cert_staged, &paths.cert_path)?;
    fs::rename(&key_staged, &paths.key_path)?;
    Ok(())
}

fn ensure_parent_exists(path: &Path) -> Result<(), TlsError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn staged_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".staged");
    path.with_file_name(name)
}

#[cfg(unix)]
fn write_staged(path: &Path, contents: &[u8], mode: u32) -> Result<(), TlsError> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn write_staged(path: &Path, contents: &[u8], _mode: u32) -> Result<(), TlsError> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    Ok(())
}
