//! Target host models

use std::path::PathBuf;
use std::sync::Arc;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer, Serialize};

/// How commands reach the asset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    #[default]
    Ssh,
    Local,
    Container,
}

/// Kind of machine behind the asset, used by the snapshot strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    #[default]
    Server,
    VirtualMachine,
    CloudInstance,
    Container,
}

/// Package manager families understood by backup and rollback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Apt,
    Yum,
    Dnf,
    Zypper,
    Apk,
}

/// Credentials used to open a connection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    /// Remote user
    pub username: String,

    /// Private key file
    #[serde(default)]
    pub identity_file: Option<PathBuf>,

    /// Password, never serialized back out
    #[serde(default, skip_serializing, deserialize_with = "deserialize_secret")]
    pub password: Option<Arc<SecretString>>,
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<Arc<SecretString>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.map(|s| Arc::new(SecretString::from(s))))
}

/// OS and package-manager hints from the inventory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OsHints {
    /// OS family, e.g. "debian", "rhel", "alpine"
    #[serde(default)]
    pub family: Option<String>,

    /// Explicit package manager, wins over the family guess
    #[serde(default)]
    pub package_manager: Option<PackageManager>,
}

/// One managed host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    /// Inventory ID
    pub id: String,

    /// Hostname or IP address; container name for container transport
    pub address: String,

    /// SSH port
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub credentials: Credentials,

    #[serde(default)]
    pub os: OsHints,

    #[serde(default)]
    pub transport: Transport,

    #[serde(default)]
    pub kind: AssetKind,

    /// Infrastructure snapshot taken out-of-band, if any
    #[serde(default)]
    pub snapshot_id: Option<String>,
}

fn default_port() -> u16 {
    22
}

impl Asset {
    /// Create an SSH asset with default settings
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            port: default_port(),
            credentials: Credentials::default(),
            os: OsHints::default(),
            transport: Transport::Ssh,
            kind: AssetKind::Server,
            snapshot_id: None,
        }
    }

    /// Package manager hinted by the inventory, if it can be derived
    pub fn hinted_package_manager(&self) -> Option<PackageManager> {
        if let Some(pm) = self.os.package_manager {
            return Some(pm);
        }
        match self.os.family.as_deref()?.to_lowercase().as_str() {
            "debian" | "ubuntu" => Some(PackageManager::Apt),
            "rhel" | "centos" | "amazon" => Some(PackageManager::Yum),
            "fedora" | "rocky" | "alma" => Some(PackageManager::Dnf),
            "suse" | "opensuse" | "sles" => Some(PackageManager::Zypper),
            "alpine" => Some(PackageManager::Apk),
            _ => None,
        }
    }
}
