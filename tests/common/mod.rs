//! Shared fixtures: a throwaway CA, leaf identities, and a recording installer.

#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use node_bootstrapper::{
    BootstrapperConfig, InstallError, PackageInstaller, PackageStream, tls,
};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, IsCa, Issuer, KeyPair, KeyUsagePurpose,
};
use tempfile::TempDir;

/// A CA that can issue leaf certificates into a temp directory.
pub struct Pki {
    issuer: Issuer<'static, KeyPair>,
    pub ca_pem: String,
    pub dir: TempDir,
}

/// Cert/key pair written to disk.
#[derive(Debug, Clone)]
pub struct Identity {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

impl Pki {
    pub fn new(ca_cn: &str) -> Self {
        let ca_key = KeyPair::generate().expect("CA key generation failed");
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, ca_cn);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca = params.self_signed(&ca_key).expect("CA generation failed");

        Self {
            ca_pem: ca.pem(),
            issuer: Issuer::new(params, ca_key),
            dir: tempfile::tempdir().expect("tempdir failed"),
        }
    }

    /// Issue a leaf valid for `localhost` and `127.0.0.1` with the given subject.
    pub fn issue(&self, stem: &str, subject: &[(DnType, &str)]) -> Identity {
        let key = KeyPair::generate().expect("leaf key generation failed");
        let mut params =
            CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()])
                .expect("leaf params");
        let mut dn = rcgen::DistinguishedName::new();
        for (ty, value) in subject {
            dn.push(ty.clone(), *value);
        }
        params.distinguished_name = dn;
        let cert = params.signed_by(&key, &self.issuer).expect("leaf signing failed");

        let identity = Identity {
            cert_file: self.dir.path().join(format!("{stem}.crt")),
            key_file: self.dir.path().join(format!("{stem}.key")),
        };
        fs::write(&identity.cert_file, cert.pem()).expect("write cert");
        fs::write(&identity.key_file, key.serialize_pem()).expect("write key");
        identity
    }

    /// Leaf with only a CN.
    pub fn issue_cn(&self, stem: &str, cn: &str) -> Identity {
        self.issue(stem, &[(DnType::CommonName, cn)])
    }

    /// Bootstrapper settings for `node` trusting this CA.
    pub fn bootstrapper_config(&self, node: &Identity, allowed: &[&str]) -> BootstrapperConfig {
        BootstrapperConfig {
            cert_file: node.cert_file.clone(),
            key_file: node.key_file.clone(),
            ca_cert_pem: self.ca_pem.clone(),
            allowed_names: allowed.iter().map(ToString::to_string).collect(),
        }
    }

    /// HTTPS client presenting `identity` and trusting this CA.
    pub fn client(&self, identity: &Identity) -> reqwest::Client {
        let tls_config =
            tls::build_client_config(&identity.cert_file, &identity.key_file, &self.ca_pem)
                .expect("client TLS config");
        reqwest::Client::builder()
            .use_preconfigured_tls(tls_config)
            .build()
            .expect("client build")
    }

    /// rustls server config for `identity` requiring client certs from this CA.
    pub fn server_config(&self, identity: &Identity) -> rustls::ServerConfig {
        tls::build_server_config(&identity.cert_file, &identity.key_file, &self.ca_pem)
            .expect("server TLS config")
    }
}

/// Installer that records every payload and returns a fixed outcome.
pub struct RecordingInstaller {
    outcome: fn() -> Result<(), InstallError>,
    payloads: Mutex<Vec<Vec<u8>>>,
}

impl RecordingInstaller {
    pub fn ok() -> Arc<Self> {
        Self::with_outcome(|| Ok(()))
    }

    pub fn with_outcome(outcome: fn() -> Result<(), InstallError>) -> Arc<Self> {
        Arc::new(Self {
            outcome,
            payloads: Mutex::new(Vec::new()),
        })
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.payloads.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.payloads.lock().unwrap().len()
    }
}

#[async_trait]
impl PackageInstaller for RecordingInstaller {
    async fn install(&self, package: PackageStream) -> Result<(), InstallError> {
        let chunks: Vec<Bytes> = package
            .try_collect()
            .await
            .map_err(|e| InstallError::Failed(e.to_string()))?;
        self.payloads.lock().unwrap().push(chunks.concat());
        (self.outcome)()
    }
}
