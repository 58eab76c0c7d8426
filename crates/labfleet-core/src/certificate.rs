//! Self-signed TLS identities for device servers
//!
//! Certificates are keyed to the server UUID (common name) and bound to the
//! host the server listens on (subject alternative name). The PEM files sit
//! next to the server record (`<slug>.crt`, `<slug>.key`); validity and SAN
//! metadata are kept in the record's `certificate` section.

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc};
use rcgen::{CertificateParams, DnType, KeyPair, SanType};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::device::ServerIdentity;
use crate::record::{write_atomic, RecordError, ServerRecord};

pub const SECTION_CERTIFICATE: &str = "certificate";
pub const DEFAULT_VALIDITY_DAYS: i64 = 365;
pub const DEFAULT_RENEWAL_WINDOW_DAYS: i64 = 30;

#[derive(Error, Debug)]
pub enum CertificateError {
    #[error("Certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),
    #[error("Cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Cannot store certificate metadata: {0}")]
    Record(#[from] RecordError),
}

/// Why a certificate is being (re)issued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalReason {
    Missing,
    Unreadable,
    HostMismatch,
    Expired,
    ExpiresSoon,
    Forced,
}

/// A certificate and its private key, both PEM encoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub certificate_pem: String,
    pub private_key_pem: String,
    pub subject_alt_names: BTreeSet<String>,
    /// SHA-256 of the DER encoded certificate, hex
    pub fingerprint: String,
}

impl Certificate {
    pub fn covers(&self, host: &str) -> bool {
        self.subject_alt_names.contains(host)
    }
}

fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// DER of the first certificate in a PEM bundle
fn first_certificate_der(pem: &str) -> Option<Vec<u8>> {
    let mut reader = pem.as_bytes();
    let first = rustls_pemfile::certs(&mut reader).next()?.ok()?;
    Some(first.as_ref().to_vec())
}

/// The key's public half must be the one embedded in the certificate
fn key_matches_certificate(key_pem: &str, cert_der: &[u8]) -> bool {
    let Ok(key_pair) = KeyPair::from_pem(key_pem) else {
        return false;
    };
    let public_key = key_pair.public_key_der();
    !public_key.is_empty()
        && cert_der
            .windows(public_key.len())
            .any(|window| window == public_key.as_slice())
}

fn midnight(at: DateTime<Utc>) -> DateTime<Utc> {
    at.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Issues and renews server certificates
#[derive(Debug, Clone)]
pub struct CertificateManager {
    validity: Duration,
    renewal_window: Duration,
    force: bool,
}

impl Default for CertificateManager {
    fn default() -> Self {
        Self {
            validity: Duration::days(DEFAULT_VALIDITY_DAYS),
            renewal_window: Duration::days(DEFAULT_RENEWAL_WINDOW_DAYS),
            force: false,
        }
    }
}

impl CertificateManager {
    pub fn new(force: bool) -> Self {
        Self {
            force,
            ..Default::default()
        }
    }

    pub fn with_validity(mut self, validity: Duration, renewal_window: Duration) -> Self {
        self.validity = validity;
        self.renewal_window = renewal_window;
        self
    }

    pub fn certificate_path(record: &ServerRecord) -> PathBuf {
        record.path().with_extension("crt")
    }

    pub fn key_path(record: &ServerRecord) -> PathBuf {
        record.path().with_extension("key")
    }

    /// Return a valid certificate for `identity`, issuing a new one if needed
    pub fn ensure_valid(
        &self,
        record: &ServerRecord,
        identity: &ServerIdentity,
    ) -> Result<Certificate, CertificateError> {
        self.ensure_valid_at(record, identity, Utc::now())
    }

    pub fn ensure_valid_at(
        &self,
        record: &ServerRecord,
        identity: &ServerIdentity,
        now: DateTime<Utc>,
    ) -> Result<Certificate, CertificateError> {
        let reason = match self.load(record) {
            Ok(cert) => match self.needs_renewal(&cert, &identity.host.to_string(), now) {
                None => {
                    debug!("Reusing certificate for {} ({})", identity.name, cert.fingerprint);
                    return Ok(cert);
                }
                Some(reason) => reason,
            },
            Err(reason) => reason,
        };

        info!("Issuing certificate for {}: {:?}", identity.name, reason);
        let cert = self.issue(identity, now)?;
        self.persist(record, &cert)?;
        Ok(cert)
    }

    /// Reason the certificate must be replaced, if any
    pub fn needs_renewal(
        &self,
        cert: &Certificate,
        host: &str,
        now: DateTime<Utc>,
    ) -> Option<RenewalReason> {
        if self.force {
            Some(RenewalReason::Forced)
        } else if !cert.covers(host) {
            Some(RenewalReason::HostMismatch)
        } else if now >= cert.not_after {
            Some(RenewalReason::Expired)
        } else if cert.not_after - now <= self.renewal_window {
            Some(RenewalReason::ExpiresSoon)
        } else {
            None
        }
    }

    fn load(&self, record: &ServerRecord) -> Result<Certificate, RenewalReason> {
        let section = SECTION_CERTIFICATE;
        let not_before = record.read::<DateTime<Utc>>(section, "not_before");
        let not_after = record.read::<DateTime<Utc>>(section, "not_after");
        let sans = record.read::<Vec<String>>(section, "subject_alt_names");
        let recorded_fingerprint = record.read::<String>(section, "fingerprint");

        let (Some(not_before), Some(not_after), Some(sans), Some(recorded_fingerprint)) =
            (not_before, not_after, sans, recorded_fingerprint)
        else {
            return Err(RenewalReason::Missing);
        };

        let read = |path: &Path| std::fs::read_to_string(path).map_err(|_| RenewalReason::Missing);
        let certificate_pem = read(&Self::certificate_path(record))?;
        let private_key_pem = read(&Self::key_path(record))?;

        let cert_der = first_certificate_der(&certificate_pem).ok_or(RenewalReason::Unreadable)?;
        if fingerprint(&cert_der) != recorded_fingerprint {
            return Err(RenewalReason::Unreadable);
        }
        if !key_matches_certificate(&private_key_pem, &cert_der) {
            return Err(RenewalReason::Unreadable);
        }

        Ok(Certificate {
            not_before,
            not_after,
            certificate_pem,
            private_key_pem,
            subject_alt_names: sans.into_iter().collect(),
            fingerprint: recorded_fingerprint,
        })
    }

    fn issue(
        &self,
        identity: &ServerIdentity,
        now: DateTime<Utc>,
    ) -> Result<Certificate, CertificateError> {
        let not_before = midnight(now);
        let not_after = not_before + self.validity;

        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, identity.uuid.to_string());
        params.subject_alt_names = vec![SanType::IpAddress(identity.host)];
        params.not_before = rcgen::date_time_ymd(
            not_before.year(),
            not_before.month() as u8,
            not_before.day() as u8,
        );
        params.not_after = rcgen::date_time_ymd(
            not_after.year(),
            not_after.month() as u8,
            not_after.day() as u8,
        );

        let key_pair = KeyPair::generate()?;
        let cert = params.self_signed(&key_pair)?;

        Ok(Certificate {
            not_before,
            not_after,
            certificate_pem: cert.pem(),
            private_key_pem: key_pair.serialize_pem(),
            subject_alt_names: BTreeSet::from([identity.host.to_string()]),
            fingerprint: fingerprint(cert.der().as_ref()),
        })
    }

    /// Write the PEM files and stage the metadata into the record
    fn persist(&self, record: &ServerRecord, cert: &Certificate) -> Result<(), CertificateError> {
        let key_path = Self::key_path(record);
        write_atomic(&key_path, cert.private_key_pem.as_bytes()).map_err(|source| {
            CertificateError::Write {
                path: key_path.clone(),
                source,
            }
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600)).map_err(
                |source| CertificateError::Write {
                    path: key_path.clone(),
                    source,
                },
            )?;
        }

        let cert_path = Self::certificate_path(record);
        write_atomic(&cert_path, cert.certificate_pem.as_bytes()).map_err(|source| {
            CertificateError::Write {
                path: cert_path,
                source,
            }
        })?;

        let section = SECTION_CERTIFICATE;
        record.write(section, "not_before", cert.not_before)?;
        record.write(section, "not_after", cert.not_after)?;
        record.write(
            section,
            "subject_alt_names",
            cert.subject_alt_names.iter().cloned().collect::<Vec<_>>(),
        )?;
        record.write(section, "fingerprint", &cert.fingerprint)?;
        Ok(())
    }
}
