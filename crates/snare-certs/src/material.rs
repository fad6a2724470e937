//! Key material and X.509 parameter construction.

use std::fs::OpenOptions;
use std::io::{self, Write as _};
use std::net::IpAddr;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use snare_core::{ErrorKind, ProxyError, GEN_CERT_FATAL};
use time::OffsetDateTime;
use x509_parser::parse_x509_certificate;

use crate::{CERT_ORG, DEFAULT_KEY_AGE};

pub(crate) struct RsaKeyMaterial {
    pub key_pair: KeyPair,
    /// PKCS#1 PEM (`BEGIN RSA PRIVATE KEY`), the on-disk format.
    pub pkcs1_pem: String,
}

pub(crate) fn generate_rsa_key(bits: usize) -> Result<RsaKeyMaterial, ProxyError> {
    let private = RsaPrivateKey::new(&mut OsRng, bits)
        .map_err(|error| ProxyError::new(ErrorKind::GenerateKey).with_cause(error))?;
    let pkcs1_pem = private
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|error| ProxyError::new(ErrorKind::GenerateKey).with_reason(error.to_string()))?
        .to_string();
    let key_pair = signing_key_pair(&private)?;
    Ok(RsaKeyMaterial { key_pair, pkcs1_pem })
}

pub(crate) fn key_pair_from_pkcs1_pem(pem: &str) -> Result<KeyPair, ProxyError> {
    let private = RsaPrivateKey::from_pkcs1_pem(pem)
        .map_err(|error| ProxyError::new(ErrorKind::CaParse).with_reason(error.to_string()))?;
    signing_key_pair(&private)
        .map_err(|error| ProxyError::new(ErrorKind::CaParse).with_cause(error))
}

/// rcgen signs through PKCS#8, so the RSA key is re-encoded before handing
/// it to the signer.
fn signing_key_pair(private: &RsaPrivateKey) -> Result<KeyPair, ProxyError> {
    let pkcs8 = private
        .to_pkcs8_der()
        .map_err(|error| ProxyError::new(ErrorKind::GenerateKey).with_reason(error.to_string()))?;
    let der = rustls::pki_types::PrivateKeyDer::Pkcs8(rustls::pki_types::PrivatePkcs8KeyDer::from(
        pkcs8.as_bytes().to_vec(),
    ));
    KeyPair::from_der_and_sign_algo(&der, &rcgen::PKCS_RSA_SHA256)
        .map_err(|error| ProxyError::new(ErrorKind::GenerateKey).with_cause(error))
}

/// Uniform random 128-bit serial. An OS RNG failure is unrecoverable and
/// takes the process down with the dedicated exit code.
pub(crate) fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    if OsRng.try_fill_bytes(&mut bytes).is_err() {
        std::process::exit(GEN_CERT_FATAL);
    }
    SerialNumber::from(bytes.to_vec())
}

pub(crate) fn ca_params(key_age: Duration) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.serial_number = Some(random_serial());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, CERT_ORG);
    dn.push(DnType::OrganizationalUnitName, CERT_ORG);
    params.distinguished_name = dn;

    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::seconds(key_age.as_secs() as i64);
    params
}

pub(crate) fn leaf_params(host: &str) -> Result<CertificateParams, ProxyError> {
    let mut params = CertificateParams::new(Vec::<String>::new())
        .map_err(|error| ProxyError::new(ErrorKind::X509Create).with_reason(error.to_string()))?;
    params.serial_number = Some(random_serial());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;

    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];

    if let Ok(ip) = host.parse::<IpAddr>() {
        params.subject_alt_names.push(SanType::IpAddress(ip));
    } else {
        params.subject_alt_names.push(SanType::DnsName(
            host.try_into()
                .map_err(|error: rcgen::Error| {
                    ProxyError::new(ErrorKind::X509Create)
                        .with_reason(format!("invalid host name {host:?}: {error}"))
                })?,
        ));
    }

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::seconds(DEFAULT_KEY_AGE.as_secs() as i64);
    Ok(params)
}

/// NotAfter of a DER certificate as a `SystemTime`.
pub(crate) fn not_after(cert_der: &[u8]) -> Result<SystemTime, ProxyError> {
    let (_, parsed) = parse_x509_certificate(cert_der)
        .map_err(|error| ProxyError::new(ErrorKind::X509Parse).with_reason(error.to_string()))?;
    let timestamp = parsed.validity().not_after.timestamp();
    if timestamp < 0 {
        return Ok(UNIX_EPOCH);
    }
    Ok(UNIX_EPOCH + Duration::from_secs(timestamp as u64))
}

pub(crate) fn write_pem_file(path: &Path, pem: &str) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(pem.as_bytes())
}

/// Default file names used when `write_ca` is called with empty paths.
pub(crate) fn derived_ca_paths() -> (String, String) {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    (
        format!("gomitmproxy_ca_{stamp}.crt"),
        format!("gomitmproxy_ca_{stamp}.key"),
    )
}
