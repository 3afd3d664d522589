// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Farm PKI
//!
//! One self-signed CA per farm and one leaf certificate per service
//! identity, generated on first start and kept under `<session>/tls/`:
//!
//! ```text
//! tls/ca.pem  tls/ca.key
//! tls/<identity>.pem  tls/<identity>.key
//! ```
//!
//! The manager also issues leaves for agents it provisions; those travel to
//! the agent as bootstrap files and are never written locally.

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("Certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),

    #[error("TLS material IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// PEM-encoded certificate and private key
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Paths of a leaf written to disk, ready for the HTTPS listener
#[derive(Debug, Clone)]
pub struct LeafPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

pub struct CertificateAuthority {
    cert: Certificate,
    key: KeyPair,
    /// PEM as first written; re-signing on load yields different bytes
    pem: String,
}

impl CertificateAuthority {
    /// Load the farm CA from `dir`, creating it on first use
    pub fn load_or_create(dir: &Path, farm: &str) -> Result<Self, TlsError> {
        std::fs::create_dir_all(dir)?;
        let cert_path = dir.join("ca.pem");
        let key_path = dir.join("ca.key");

        if cert_path.exists() && key_path.exists() {
            let pem = std::fs::read_to_string(&cert_path)?;
            let key = KeyPair::from_pem(&std::fs::read_to_string(&key_path)?)?;
            let params = CertificateParams::from_ca_cert_pem(&pem)?;
            let cert = params.self_signed(&key)?;
            return Ok(Self { cert, key, pem });
        }

        let key = KeyPair::generate()?;
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params
            .distinguished_name
            .push(DnType::CommonName, format!("{} farm CA", farm));
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let cert = params.self_signed(&key)?;
        let pem = cert.pem();
        write_private(&key_path, &key.serialize_pem())?;
        std::fs::write(&cert_path, &pem)?;
        info!(path = %cert_path.display(), "Generated farm certificate authority");
        Ok(Self { cert, key, pem })
    }

    pub fn cert_pem(&self) -> &str {
        &self.pem
    }

    /// Sign a fresh server/client leaf for `identity`
    pub fn issue(&self, identity: &str, alt_names: &[String]) -> Result<IssuedCertificate, TlsError> {
        let mut names: Vec<String> = vec![identity.to_string(), "localhost".to_string()];
        for name in alt_names {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        let key = KeyPair::generate()?;
        let mut params = CertificateParams::new(names)?;
        params.distinguished_name.push(DnType::CommonName, identity);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let cert = params.signed_by(&key, &self.cert, &self.key)?;
        Ok(IssuedCertificate {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }

    /// Leaf for this process, reused across restarts
    pub fn ensure_leaf(
        &self,
        dir: &Path,
        identity: &str,
        alt_names: &[String],
    ) -> Result<LeafPaths, TlsError> {
        let paths = LeafPaths {
            cert: dir.join(format!("{}.pem", identity)),
            key: dir.join(format!("{}.key", identity)),
        };
        if paths.cert.exists() && paths.key.exists() {
            return Ok(paths);
        }
        let issued = self.issue(identity, alt_names)?;
        write_private(&paths.key, &issued.key_pem)?;
        std::fs::write(&paths.cert, &issued.cert_pem)?;
        info!(identity, path = %paths.cert.display(), "Issued service certificate");
        Ok(paths)
    }
}

/// Listener leaf for `identity`
///
/// A leaf already present is used as is, so agents bootstrapped with a
/// manager-issued certificate never need the CA key.
pub fn prepare_listener(
    dir: &Path,
    farm: &str,
    identity: &str,
    alt_names: &[String],
) -> Result<LeafPaths, TlsError> {
    let paths = LeafPaths {
        cert: dir.join(format!("{}.pem", identity)),
        key: dir.join(format!("{}.key", identity)),
    };
    if paths.cert.exists() && paths.key.exists() {
        return Ok(paths);
    }
    CertificateAuthority::load_or_create(dir, farm)?.ensure_leaf(dir, identity, alt_names)
}

fn write_private(path: &Path, contents: &str) -> Result<(), TlsError> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_ca_is_created_once() {
        let dir = TempDir::new().unwrap();
        let first = CertificateAuthority::load_or_create(dir.path(), "test").unwrap();
        let pem = first.cert_pem().to_string();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));

        let second = CertificateAuthority::load_or_create(dir.path(), "test").unwrap();
        assert_eq!(second.cert_pem(), pem);
    }

    #[test]
    fn test_leaf_is_reused() {
        let dir = TempDir::new().unwrap();
        let ca = CertificateAuthority::load_or_create(dir.path(), "test").unwrap();
        let paths = ca
            .ensure_leaf(dir.path(), "manager", &["10.0.0.1".to_string()])
            .unwrap();
        let cert = std::fs::read_to_string(&paths.cert).unwrap();
        assert!(std::fs::read_to_string(&paths.key).unwrap().contains("PRIVATE KEY"));

        let again = ca.ensure_leaf(dir.path(), "manager", &[]).unwrap();
        assert_eq!(std::fs::read_to_string(again.cert).unwrap(), cert);
    }

    #[test]
    fn test_bootstrapped_leaf_needs_no_ca() {
        let manager = TempDir::new().unwrap();
        let agent = TempDir::new().unwrap();
        let ca = CertificateAuthority::load_or_create(manager.path(), "test").unwrap();
        let issued = ca.issue("agent-a", &[]).unwrap();
        std::fs::write(agent.path().join("agent-a.pem"), &issued.cert_pem).unwrap();
        std::fs::write(agent.path().join("agent-a.key"), &issued.key_pem).unwrap();

        let paths = prepare_listener(agent.path(), "test", "agent-a", &[]).unwrap();
        assert_eq!(std::fs::read_to_string(paths.cert).unwrap(), issued.cert_pem);
        assert!(!agent.path().join("ca.key").exists());
    }

    #[test]
    fn test_issued_leaf_differs_per_identity() {
        let dir = TempDir::new().unwrap();
        let ca = CertificateAuthority::load_or_create(dir.path(), "test").unwrap();
        let a = ca.issue("agent-a", &[]).unwrap();
        let b = ca.issue("agent-b", &[]).unwrap();
        assert_ne!(a.cert_pem, b.cert_pem);
        assert_ne!(a.key_pem, b.key_pem);
    }
}
