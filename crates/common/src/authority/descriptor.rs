//! Bootstrap descriptor ("incoming site") handed to mesh clients

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Overlay address of the default lighthouse
pub const DEFAULT_LIGHTHOUSE: &str = "69.69.0.1";

/// One entry in the static host map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticHost {
    pub lighthouse: bool,
    pub destinations: Vec<String>,
}

/// The document a mesh client imports to join the overlay.
/// Key names are fixed by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingSite {
    pub name: String,
    pub id: String,
    pub static_hostmap: BTreeMap<String, StaticHost>,
    pub unsafe_routes: Vec<String>,
    pub ca: String,
    pub cert: String,
    pub key: String,
    pub lh_duration: u32,
    pub port: u16,
    pub mtu: u32,
    pub cipher: String,
    pub sort_key: i64,
    pub log_verbosity: String,
    pub managed: bool,
    pub raw_config: Option<String>,
}

/// Operator-controlled parts of the descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteTemplate {
    /// Lighthouse overlay address to its public `host:port` endpoints
    pub lighthouses: BTreeMap<String, Vec<String>>,
    pub mtu: u32,
    pub cipher: String,
    pub log_verbosity: String,
}

impl Default for SiteTemplate {
    fn default() -> Self {
        let mut lighthouses = BTreeMap::new();
        lighthouses.insert(
            DEFAULT_LIGHTHOUSE.to_string(),
            vec!["127.0.0.1:4242".to_string()],
        );
        Self {
            lighthouses,
            mtu: 1300,
            cipher: "aes".to_string(),
            log_verbosity: "info".to_string(),
        }
    }
}

impl SiteTemplate {
    /// Descriptor for the certificate named `name`.
    pub fn render(&self, name: &str) -> IncomingSite {
        let static_hostmap = self
            .lighthouses
            .iter()
            .map(|(addr, destinations)| {
                (
                    addr.clone(),
                    StaticHost {
                        lighthouse: true,
                        destinations: destinations.clone(),
                    },
                )
            })
            .collect();

        IncomingSite {
            name: name.to_string(),
            id: name.to_string(),
            static_hostmap,
            unsafe_routes: Vec::new(),
            ca: String::new(),
            cert: String::new(),
            key: String::new(),
            lh_duration: 0,
            port: 0,
            mtu: self.mtu,
            cipher: self.cipher.clone(),
            sort_key: 0,
            log_verbosity: self.log_verbosity.clone(),
            managed: false,
            raw_config: None,
        }
    }
}
