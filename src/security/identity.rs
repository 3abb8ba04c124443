use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::Result;
use crate::ids::new_id;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IdentityProvider {
    Oidc,
    Github,
    Google,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: String,
    pub provider: IdentityProvider,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub verified: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Desktop,
    Mobile,
    Server,
    Ci,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Untrusted,
    Verified,
    Trusted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub device_type: DeviceType,
    pub trust_level: TrustLevel,
    pub last_seen: DateTime<Utc>,
}

/// Owns Users and Devices, per the ownership rule in the data model.
#[derive(Default)]
pub struct IdentityStore {
    users: RwLock<HashMap<String, UserIdentity>>,
    devices: RwLock<HashMap<String, Device>>,
}

impl IdentityStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// No real credential validation happens here — that is left to an
    /// identity collaborator; this registers/looks up the claimed identity.
    pub async fn authenticate_user(&self, provider: IdentityProvider, subject: &str) -> Result<UserIdentity> {
        let mut users = self.users.write().await;
        if let Some(existing) = users.get(subject) {
            return Ok(existing.clone());
        }
        let user = UserIdentity {
            id: subject.to_string(),
            provider,
            email: None,
            display_name: None,
            verified: true,
        };
        users.insert(subject.to_string(), user.clone());
        Ok(user)
    }

    /// Returns an existing device (updating `last_seen`), otherwise registers
    /// a new one at `untrusted`. Trust level promotion is monotonic and is
    /// performed out of band (not part of this call).
    pub async fn verify_device(&self, device_id: &str, device_type: DeviceType) -> Result<Device> {
        let mut devices = self.devices.write().await;
        if let Some(existing) = devices.get_mut(device_id) {
            existing.last_seen = Utc::now();
            return Ok(existing.clone());
        }
        let device = Device {
            id: device_id.to_string(),
            device_type,
            trust_level: TrustLevel::Untrusted,
            last_seen: Utc::now(),
        };
        devices.insert(device_id.to_string(), device.clone());
        Ok(device)
    }

    /// Promotes a device's trust level. Never downgrades implicitly: a
    /// request to set a lower level than the device currently holds is a
    /// no-op, returning the unchanged device.
    pub async fn set_device_trust(&self, device_id: &str, level: TrustLevel) -> Result<Option<Device>> {
        let mut devices = self.devices.write().await;
        match devices.get_mut(device_id) {
            Some(device) => {
                if level > device.trust_level {
                    device.trust_level = level;
                }
                Ok(Some(device.clone()))
            }
            None => Ok(None),
        }
    }

    pub async fn get_device(&self, device_id: &str) -> Result<Option<Device>> {
        Ok(self.devices.read().await.get(device_id).cloned())
    }
}

pub fn new_device_id() -> String {
    new_id()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_device_registers_at_untrusted() {
        let store = IdentityStore::new();
        let device = store.verify_device("d1", DeviceType::Desktop).await.unwrap();
        assert_eq!(device.trust_level, TrustLevel::Untrusted);
    }

    #[tokio::test]
    async fn trust_promotion_is_monotonic() {
        let store = IdentityStore::new();
        store.verify_device("d1", DeviceType::Desktop).await.unwrap();
        store.set_device_trust("d1", TrustLevel::Trusted).await.unwrap();
        let device = store.set_device_trust("d1", TrustLevel::Untrusted).await.unwrap().unwrap();
        assert_eq!(device.trust_level, TrustLevel::Trusted);
    }

    #[tokio::test]
    async fn authenticate_is_stable_across_calls() {
        let store = IdentityStore::new();
        let first = store.authenticate_user(IdentityProvider::Github, "alice").await.unwrap();
        let second = store.authenticate_user(IdentityProvider::Github, "alice").await.unwrap();
        assert_eq!(first.id, second.id);
    }
}
