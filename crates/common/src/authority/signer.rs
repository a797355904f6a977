//! Certificate signing capability
//!
//! [`NebulaCertSigner`] drives the `nebula-cert` tool. Each signing call
//! works in its own temporary directory, removed when the call returns.

use crate::{Error, Result};
use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// One certificate to sign
#[derive(Debug, Clone)]
pub struct SignRequest<'a> {
    pub public_key: &'a str,
    /// Certificate name, unique per issuance
    pub name: &'a str,
    /// Overlay address with prefix length
    pub address: Ipv4Network,
}

/// Outcome of root bootstrap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootStatus {
    Existing,
    Generated,
}

#[async_trait]
pub trait Signer: Send + Sync {
    /// Make sure root material exists, generating it if not.
    async fn ensure_root(&self) -> Result<RootStatus>;

    /// Sign a device public key, returning the certificate text.
    async fn sign(&self, request: &SignRequest<'_>) -> Result<String>;

    /// The root certificate devices validate against.
    async fn trust_anchor(&self) -> Result<String>;
}

/// Subprocess signer around `nebula-cert`
#[derive(Debug, Clone)]
pub struct NebulaCertSigner {
    tool: PathBuf,
    pki_dir: PathBuf,
    ca_name: String,
    timeout: Duration,
    cert_duration: Option<Duration>,
}

impl NebulaCertSigner {
    pub fn new(tool: impl Into<PathBuf>, pki_dir: impl Into<PathBuf>, ca_name: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            pki_dir: pki_dir.into(),
            ca_name: ca_name.into(),
            timeout: Duration::from_secs(30),
            cert_duration: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Validity of issued certificates. Unset means the tool's default,
    /// which ends just before the root expires.
    pub fn with_cert_duration(mut self, duration: Option<Duration>) -> Self {
        self.cert_duration = duration;
        self
    }

    pub fn ca_cert_path(&self) -> PathBuf {
        self.pki_dir.join("ca.crt")
    }

    pub fn ca_key_path(&self) -> PathBuf {
        self.pki_dir.join("ca.key")
    }

    async fn run(&self, args: &[String]) -> Result<Output> {
        debug!("Running {} {}", self.tool.display(), args.join(" "));

        let child = Command::new(&self.tool)
            .args(args)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| Error::Timeout {
                seconds: self.timeout.as_secs(),
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(
                "{} failed ({}): stdout={} stderr={}",
                self.tool.display(),
                output.status,
                String::from_utf8_lossy(&output.stdout).trim(),
                stderr
            );
            return Err(Error::SignerFailed {
                status: output.status.to_string(),
                stderr,
            });
        }

        Ok(output)
    }
}

#[async_trait]
impl Signer for NebulaCertSigner {
    async fn ensure_root(&self) -> Result<RootStatus> {
        let crt = self.ca_cert_path();
        let key = self.ca_key_path();

        if is_file(&crt).await && is_file(&key).await {
            debug!("Root material present in {}", self.pki_dir.display());
            return Ok(RootStatus::Existing);
        }

        // A half-present pair is not reconciled, both halves are regenerated
        for path in [&crt, &key] {
            if is_file(path).await {
                warn!("Removing unpaired root file {}", path.display());
                tokio::fs::remove_file(path).await?;
            }
        }

        tokio::fs::create_dir_all(&self.pki_dir).await?;

        let args = vec![
            "ca".to_string(),
            "-name".to_string(),
            self.ca_name.clone(),
            "-out-crt".to_string(),
            path_arg(&crt),
            "-out-key".to_string(),
            path_arg(&key),
        ];
        self.run(&args).await?;

        for path in [&crt, &key] {
            if !is_file(path).await {
                return Err(Error::MissingArtifact(path.display().to_string()));
            }
        }

        info!("Generated root authority '{}' in {}", self.ca_name, self.pki_dir.display());
        Ok(RootStatus::Generated)
    }

    async fn sign(&self, request: &SignRequest<'_>) -> Result<String> {
        if request.public_key.trim().is_empty() {
            return Err(Error::InvalidInput("public key is empty".to_string()));
        }

        let work = tempfile::Builder::new().prefix("meshgate-sign-").tempdir()?;
        let pub_path = work.path().join(format!("{}.pub", request.name));
        let crt_path = work.path().join(format!("{}.crt", request.name));

        tokio::fs::write(&pub_path, request.public_key).await?;

        let mut args = vec![
            "sign".to_string(),
            "-ca-crt".to_string(),
            path_arg(&self.ca_cert_path()),
            "-ca-key".to_string(),
            path_arg(&self.ca_key_path()),
            "-in-pub".to_string(),
            path_arg(&pub_path),
            "-name".to_string(),
            request.name.to_string(),
            "-ip".to_string(),
            request.address.to_string(),
            "-out-crt".to_string(),
            path_arg(&crt_path),
        ];
        if let Some(duration) = self.cert_duration {
            args.push("-duration".to_string());
            args.push(format!("{}s", duration.as_secs()));
        }

        self.run(&args).await?;

        let certificate = match tokio::fs::read_to_string(&crt_path).await {
            Ok(cert) => cert,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::MissingArtifact(crt_path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        debug!("Signed {} for {}", request.name, request.address);
        Ok(certificate)
    }

    async fn trust_anchor(&self) -> Result<String> {
        let path = self.ca_cert_path();
        match tokio::fs::read_to_string(&path).await {
            Ok(cert) => Ok(cert),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::MissingArtifact(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
