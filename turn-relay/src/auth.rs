//! Credential bridge: long-term credential keys from the room registry.
//!
//! The TURN username is a room identifier and the password is the room's
//! shared secret. Keys are derived on every request and never cached, so
//! a rotated secret or a deleted room takes effect on the next request.

use crate::config::RoomConfig;
use crate::overlay::AddressKind;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use turn_types::LongTermKey;
use zeroize::Zeroizing;

/// A room as seen by the relay.
#[derive(Clone, PartialEq, Eq)]
pub struct Room {
    /// Room identifier, used as the TURN username.
    pub id: String,
    /// Shared secret, used as the TURN password.
    pub credential: String,
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("credential", &"<redacted>")
            .finish()
    }
}

/// Read access to the room service.
#[async_trait]
pub trait RoomRegistry: Send + Sync {
    /// Look up a live room by identifier.
    async fn lookup_room(&self, identifier: &str) -> Option<Room>;
}

/// In-process room registry.
#[derive(Debug, Default)]
pub struct MemoryRoomRegistry {
    rooms: DashMap<String, String>,
}

impl MemoryRoomRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry seeded from `[[rooms]]` config entries.
    pub fn from_config(rooms: &[RoomConfig]) -> Self {
        let registry = Self::new();
        for room in rooms {
            registry.insert(&room.id, &room.credential);
        }
        registry
    }

    /// Add a room or replace its secret.
    pub fn insert(&self, id: &str, credential: &str) {
        self.rooms.insert(id.to_string(), credential.to_string());
    }

    /// Delete a room.
    pub fn remove(&self, id: &str) -> bool {
        self.rooms.remove(id).is_some()
    }

    /// Number of rooms.
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    /// Whether there are no rooms.
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

#[async_trait]
impl RoomRegistry for MemoryRoomRegistry {
    async fn lookup_room(&self, identifier: &str) -> Option<Room> {
        self.rooms.get(identifier).map(|entry| Room {
            id: entry.key().clone(),
            credential: entry.value().clone(),
        })
    }
}

/// Turns (identifier, realm, transport kind) into a message-integrity key.
#[derive(Clone)]
pub struct CredentialBridge {
    rooms: Arc<dyn RoomRegistry>,
}

impl CredentialBridge {
    /// Create a bridge over a room registry.
    pub fn new(rooms: Arc<dyn RoomRegistry>) -> Self {
        Self { rooms }
    }

    /// Key for `identifier` in `realm`, or `None`.
    ///
    /// Requests that did not arrive over the overlay never authenticate.
    /// A missing room is indistinguishable from a wrong password to the
    /// caller.
    pub async fn authenticate(
        &self,
        identifier: &str,
        realm: &str,
        kind: AddressKind,
    ) -> Option<LongTermKey> {
        if kind != AddressKind::Overlay {
            tracing::debug!(identifier, "refusing credentials over conventional transport");
            return None;
        }
        let room = self.rooms.lookup_room(identifier).await?;
        let secret = Zeroizing::new(room.credential);
        Some(LongTermKey::derive(identifier, realm, &secret))
    }
}

impl std::fmt::Debug for CredentialBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialBridge").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge_with(rooms: &Arc<MemoryRoomRegistry>) -> CredentialBridge {
        let registry: Arc<dyn RoomRegistry> = rooms.clone();
        CredentialBridge::new(registry)
    }

    #[tokio::test]
    async fn overlay_request_derives_room_key() {
        let rooms = Arc::new(MemoryRoomRegistry::new());
        rooms.insert("room-42", "s3cr3t");
        let bridge = bridge_with(&rooms);

        let key = bridge
            .authenticate("room-42", "rtchat.io", AddressKind::Overlay)
            .await
            .unwrap();
        assert_eq!(
            hex::encode(key.as_bytes()),
            "01cd7594687b623f69ca1fa3aba9dafc"
        );
        let again = bridge
            .authenticate("room-42", "rtchat.io", AddressKind::Overlay)
            .await
            .unwrap();
        assert_eq!(key, again);
    }

    #[tokio::test]
    async fn conventional_request_never_authenticates() {
        let rooms = Arc::new(MemoryRoomRegistry::new());
        rooms.insert("room-42", "s3cr3t");
        let bridge = bridge_with(&rooms);

        assert!(bridge
            .authenticate("room-42", "rtchat.io", AddressKind::Conventional)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn missing_room_is_none() {
        let rooms = Arc::new(MemoryRoomRegistry::new());
        let bridge = bridge_with(&rooms);
        assert!(bridge
            .authenticate("room-404", "rtchat.io", AddressKind::Overlay)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn rotation_and_deletion_apply_immediately() {
        let rooms = Arc::new(MemoryRoomRegistry::new());
        rooms.insert("room-42", "s3cr3t");
        let bridge = bridge_with(&rooms);

        let before = bridge
            .authenticate("room-42", "rtchat.io", AddressKind::Overlay)
            .await
            .unwrap();
        rooms.insert("room-42", "rotated");
        let after = bridge
            .authenticate("room-42", "rtchat.io", AddressKind::Overlay)
            .await
            .unwrap();
        assert_ne!(before, after);

        assert!(rooms.remove("room-42"));
        assert!(bridge
            .authenticate("room-42", "rtchat.io", AddressKind::Overlay)
            .await
            .is_none());
    }

    #[test]
    fn room_debug_hides_secret() {
        let room = Room {
            id: "room-42".into(),
            credential: "s3cr3t".into(),
        };
        assert!(!format!("{room:?}").contains("s3cr3t"));
    }

    #[test]
    fn seeded_from_config() {
        let rooms = MemoryRoomRegistry::from_config(&[RoomConfig {
            id: "a".into(),
            credential: "b".into(),
        }]);
        assert_eq!(rooms.len(), 1);
    }
}
