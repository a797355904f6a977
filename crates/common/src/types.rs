//! Core types for meshgate

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// A registered device.
///
/// `device_id` is chosen by the client and is stable across reinstalls;
/// `id` is assigned by the registry. `(device_id, user_id)` is unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: Uuid,
    pub device_id: String,
    pub user_id: Uuid,
    pub machine_name: String,
    pub platform: String,
    /// Overlay address, set on first issuance and never reassigned.
    pub ip_address: Option<String>,
    pub created: i64,
    /// Milliseconds since the epoch.
    pub updated: i64,
}

/// Device registration request body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDevice {
    #[serde(alias = "device_id")]
    pub device_id: String,
    #[serde(alias = "machine_name")]
    pub machine_name: String,
    #[serde(default)]
    pub platform: String,
}

impl NewDevice {
    pub fn validate(&self) -> Result<()> {
        if self.device_id.trim().is_empty() {
            return Err(Error::InvalidInput("deviceId is required".to_string()));
        }
        if self.machine_name.trim().is_empty() {
            return Err(Error::InvalidInput("machineName is required".to_string()));
        }
        Ok(())
    }
}

/// Device as it appears inside outbound signaling envelopes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceView {
    pub id: String,
    pub machine_name: String,
    pub platform: String,
    pub device_id: String,
    #[serde(default)]
    pub ip_address: String,
    pub created: i64,
    pub updated: i64,
    pub user_id: String,
}

impl From<&Device> for DeviceView {
    fn from(device: &Device) -> Self {
        Self {
            id: device.id.to_string(),
            machine_name: device.machine_name.clone(),
            platform: device.platform.clone(),
            device_id: device.device_id.clone(),
            ip_address: device.ip_address.clone().unwrap_or_default(),
            created: device.created,
            updated: device.updated,
            user_id: device.user_id.to_string(),
        }
    }
}

/// Membership of one device in one externally managed overlay network.
/// `(network_id, node_id)` is unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    pub id: Uuid,
    pub machine_name: String,
    pub network_id: String,
    pub node_id: String,
    pub user_id: Uuid,
    pub platform: Option<String>,
    pub ip_address: Option<String>,
    pub created: i64,
    pub updated: i64,
}

/// Peer registration request body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPeer {
    #[serde(alias = "machine_name")]
    pub machine_name: String,
    #[serde(alias = "network_id")]
    pub network_id: String,
    #[serde(alias = "node_id")]
    pub node_id: String,
    #[serde(default)]
    pub platform: Option<String>,
}

impl NewPeer {
    pub fn validate(&self) -> Result<()> {
        if self.network_id.trim().is_empty() || self.node_id.trim().is_empty() {
            return Err(Error::InvalidInput(
                "networkId and nodeId are required".to_string(),
            ));
        }
        Ok(())
    }
}

/// An authenticated user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    /// Subject identifier at the identity provider
    pub subject: String,
    pub email: String,
    pub name: String,
    pub given_name: String,
    pub family_name: String,
    pub picture: Option<String>,
    pub locale: Option<String>,
    pub verified_email: bool,
}

/// Profile returned by the identity provider's userinfo endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub verified_email: bool,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub given_name: String,
    #[serde(default)]
    pub family_name: String,
    #[serde(default)]
    pub picture: Option<String>,
    #[serde(default)]
    pub locale: Option<String>,
}

/// Inbound signaling envelope, as sent by a device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
    /// Sender's client-chosen device identifier
    #[serde(default)]
    pub unique_id: String,
    /// Target device; the send route fills it from its path
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub sender_id: String,
}

impl SignalRequest {
    pub fn validate(&self) -> Result<()> {
        if self.kind.is_empty() {
            return Err(Error::InvalidInput("type is required".to_string()));
        }
        if self.device_id.is_empty() {
            return Err(Error::InvalidInput("deviceId is required".to_string()));
        }
        Ok(())
    }

    /// Attach the resolved sender and produce the outbound envelope.
    pub fn into_response(self, sender: &Device) -> SignalResponse {
        SignalResponse {
            kind: self.kind,
            data: self.data,
            device: DeviceView::from(sender),
        }
    }
}

/// Outbound signaling envelope, as delivered to a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalResponse {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub device: DeviceView,
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        Device {
            id: Uuid::new_v4(),
            device_id: "laptop-1".to_string(),
            user_id: Uuid::new_v4(),
            machine_name: "laptop".to_string(),
            platform: "linux".to_string(),
            ip_address: None,
            created: 1,
            updated: 2,
        }
    }

    #[test]
    fn test_signal_request_wire_names() {
        let raw = r#"{"type":"offer","data":{"sdp":"x"},"uniqueId":"a","deviceId":"b","senderId":"c"}"#;
        let req: SignalRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.kind, "offer");
        assert_eq!(req.device_id, "b");
        assert_eq!(req.unique_id, "a");
        req.validate().unwrap();
    }

    #[test]
    fn test_signal_request_requires_target() {
        let req: SignalRequest = serde_json::from_str(r#"{"type":"offer","deviceId":""}"#).unwrap();
        assert!(matches!(req.validate(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_response_carries_device_view() {
        let sender = device();
        let req: SignalRequest =
            serde_json::from_str(r#"{"type":"ping","data":[1,2],"deviceId":"phone"}"#).unwrap();
        let resp = req.into_response(&sender);

        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["type"], "ping");
        assert_eq!(json["data"], serde_json::json!([1, 2]));
        assert_eq!(json["device"]["deviceId"], "laptop-1");
        assert_eq!(json["device"]["machineName"], "laptop");
        assert_eq!(json["device"]["ipAddress"], "");
        assert_eq!(json["device"]["userId"], sender.user_id.to_string());
    }

    #[test]
    fn test_new_device_accepts_snake_case() {
        let dev: NewDevice =
            serde_json::from_str(r#"{"device_id":"d1","machine_name":"box","platform":"mac"}"#)
                .unwrap();
        assert_eq!(dev.device_id, "d1");
        dev.validate().unwrap();

        let empty: NewDevice = serde_json::from_str(r#"{"deviceId":" ","machineName":"box"}"#).unwrap();
        assert!(empty.validate().is_err());
    }
}
