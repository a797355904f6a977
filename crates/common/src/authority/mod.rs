//! Trust and address issuance authority
//!
//! Turns a device public key into a signed overlay certificate, the root
//! trust anchor and a bootstrap descriptor. The device's overlay address is
//! leased on first issuance and reused afterwards.

pub mod descriptor;
pub mod signer;

pub use descriptor::{IncomingSite, SiteTemplate, StaticHost};
pub use signer::{NebulaCertSigner, RootStatus, SignRequest, Signer};

use crate::address::AddressAllocator;
use crate::registry::DeviceRegistry;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// Default suffix of issued certificate names
pub const DEFAULT_CERT_DOMAIN: &str = "mesh.local";

/// Issuance request body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueRequest {
    #[serde(alias = "public_key")]
    pub public_key: String,
    #[serde(alias = "device_id")]
    pub device_id: String,
}

impl IssueRequest {
    pub fn validate(&self) -> Result<()> {
        if self.public_key.trim().is_empty() {
            return Err(Error::InvalidInput("publicKey is required".to_string()));
        }
        if self.device_id.trim().is_empty() {
            return Err(Error::InvalidInput("deviceId is required".to_string()));
        }
        Ok(())
    }
}

/// Issuance result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedCertificate {
    pub signed_key: String,
    pub ca_cert: String,
    pub incoming_site: IncomingSite,
}

pub struct TrustAuthority {
    registry: Arc<dyn DeviceRegistry>,
    signer: Arc<dyn Signer>,
    allocator: AddressAllocator,
    site: SiteTemplate,
    cert_domain: String,
}

impl TrustAuthority {
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        signer: Arc<dyn Signer>,
        allocator: AddressAllocator,
        site: SiteTemplate,
        cert_domain: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            signer,
            allocator,
            site,
            cert_domain: cert_domain.into(),
        }
    }

    pub fn allocator(&self) -> &AddressAllocator {
        &self.allocator
    }

    /// Generate root material if it does not exist yet.
    pub async fn bootstrap(&self) -> Result<RootStatus> {
        let status = self.signer.ensure_root().await?;
        info!("Root authority ready ({:?})", status);
        Ok(status)
    }

    /// Issue a certificate for one of `user_id`'s devices.
    pub async fn sign_public_key(&self, user_id: Uuid, request: &IssueRequest) -> Result<IssuedCertificate> {
        request.validate()?;

        let device = self
            .registry
            .find_user_device(user_id, &request.device_id)
            .await
            .map_err(|e| {
                error!("Registry lookup for {} failed: {}", request.device_id, e);
                e
            })?
            .ok_or_else(|| Error::not_found("device", request.device_id.clone()))?;

        let address = self
            .registry
            .lease_address(device.id, &self.allocator)
            .await
            .map_err(|e| {
                error!("Address lease for {} failed: {}", device.device_id, e);
                e
            })?;

        let name = format!("{}.{}", Uuid::new_v4(), self.cert_domain);
        let sign_request = SignRequest {
            public_key: &request.public_key,
            name: &name,
            address: self.allocator.with_prefix(address)?,
        };

        let signed_key = self.signer.sign(&sign_request).await.map_err(|e| {
            error!("Signing {} for {} failed: {}", name, device.device_id, e);
            e
        })?;
        let ca_cert = self.signer.trust_anchor().await.map_err(|e| {
            error!("Reading trust anchor failed: {}", e);
            e
        })?;

        info!("Issued {} to device {} at {}", name, device.device_id, address);

        Ok(IssuedCertificate {
            signed_key,
            ca_cert,
            incoming_site: self.site.render(&name),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::{new_device, profile, test_registry};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSigner {
        calls: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl Signer for RecordingSigner {
        async fn ensure_root(&self) -> Result<RootStatus> {
            Ok(RootStatus::Existing)
        }

        async fn sign(&self, request: &SignRequest<'_>) -> Result<String> {
            if self.fail {
                return Err(Error::SignerFailed {
                    status: "exit status: 1".to_string(),
                    stderr: "boom".to_string(),
                });
            }
            self.calls
                .lock()
                .push((request.name.to_string(), request.address.to_string()));
            Ok(format!("CERT {}", request.name))
        }

        async fn trust_anchor(&self) -> Result<String> {
            Ok("ROOT".to_string())
        }
    }

    async fn authority(signer: Arc<RecordingSigner>) -> (TrustAuthority, Uuid) {
        let registry = test_registry();
        let user = registry.upsert_user(&profile("a@example.com")).await.unwrap();
        registry.register_device(user.id, &new_device("laptop")).await.unwrap();
        registry.register_device(user.id, &new_device("phone")).await.unwrap();

        let authority = TrustAuthority::new(
            Arc::new(registry),
            signer,
            AddressAllocator::default(),
            SiteTemplate::default(),
            "mesh.test",
        );
        (authority, user.id)
    }

    fn issue(device: &str) -> IssueRequest {
        IssueRequest {
            public_key: "PUBKEY".to_string(),
            device_id: device.to_string(),
        }
    }

    #[tokio::test]
    async fn test_issuance_reuses_lease() {
        let signer = Arc::new(RecordingSigner::default());
        let (authority, user) = authority(signer.clone()).await;

        let first = authority.sign_public_key(user, &issue("laptop")).await.unwrap();
        let second = authority.sign_public_key(user, &issue("laptop")).await.unwrap();
        authority.sign_public_key(user, &issue("phone")).await.unwrap();

        let calls = signer.calls.lock().clone();
        assert_eq!(calls[0].1, "69.69.0.2/16");
        assert_eq!(calls[1].1, "69.69.0.2/16");
        assert_eq!(calls[2].1, "69.69.0.3/16");

        // Fresh certificate name each time
        assert_ne!(first.incoming_site.name, second.incoming_site.name);
        assert_eq!(first.ca_cert, "ROOT");
        assert_eq!(first.signed_key, format!("CERT {}", calls[0].0));
    }

    #[tokio::test]
    async fn test_descriptor_named_after_certificate() {
        let signer = Arc::new(RecordingSigner::default());
        let (authority, user) = authority(signer.clone()).await;

        let issued = authority.sign_public_key(user, &issue("laptop")).await.unwrap();
        let name = &issued.incoming_site.name;
        assert!(name.ends_with(".mesh.test"));
        assert_eq!(&issued.incoming_site.id, name);
        assert_eq!(signer.calls.lock()[0].0, *name);

        let json = serde_json::to_value(&issued).unwrap();
        assert!(json.get("signedKey").is_some());
        assert!(json.get("caCert").is_some());
        assert_eq!(json["incomingSite"]["mtu"], 1300);
    }

    #[tokio::test]
    async fn test_unknown_or_foreign_device() {
        let (authority, user) = authority(Arc::new(RecordingSigner::default())).await;

        assert!(matches!(
            authority.sign_public_key(user, &issue("tablet")).await,
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            authority.sign_public_key(Uuid::new_v4(), &issue("laptop")).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_signer_failure_surfaces() {
        let signer = Arc::new(RecordingSigner {
            fail: true,
            ..Default::default()
        });
        let (authority, user) = authority(signer).await;

        assert!(matches!(
            authority.sign_public_key(user, &issue("laptop")).await,
            Err(Error::SignerFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_request_validation() {
        let (authority, user) = authority(Arc::new(RecordingSigner::default())).await;
        let mut request = issue("laptop");
        request.public_key = String::new();
        assert!(matches!(
            authority.sign_public_key(user, &request).await,
            Err(Error::InvalidInput(_))
        ));

        let parsed: IssueRequest =
            serde_json::from_str(r#"{"public_key":"K","device_id":"d"}"#).unwrap();
        assert_eq!(parsed.device_id, "d");
    }
}
