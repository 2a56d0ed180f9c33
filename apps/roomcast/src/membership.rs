use std::sync::Arc;

use shared_store::Store;

use crate::errors::WsError;

/// Cluster-wide room membership, kept as two sets per relationship:
/// `ws_room:<instance>` holds user ids, `ws_user:<userId>` holds room
/// instances. The pair is written as two independent single-key operations;
/// a crash between them is the only source of asymmetry. The records are
/// advisory for access control and presence, not a strict consistency
/// boundary.
#[derive(Clone)]
pub struct Membership {
    store: Arc<dyn Store>,
}

impl Membership {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn add(&self, instance: &str, user_id: &str) -> Result<(), WsError> {
        self.store
            .sadd(&room_members_key(instance), user_id)
            .await?;
        self.store.sadd(&user_rooms_key(user_id), instance).await?;
        Ok(())
    }

    pub async fn remove(&self, instance: &str, user_id: &str) -> Result<(), WsError> {
        self.store
            .srem(&room_members_key(instance), user_id)
            .await?;
        self.store.srem(&user_rooms_key(user_id), instance).await?;
        Ok(())
    }

    pub async fn is_member(&self, instance: &str, user_id: &str) -> Result<bool, WsError> {
        Ok(self
            .store
            .sismember(&room_members_key(instance), user_id)
            .await?)
    }

    pub async fn members(&self, instance: &str) -> Result<Vec<String>, WsError> {
        Ok(self.store.smembers(&room_members_key(instance)).await?)
    }

    pub async fn rooms_of(&self, user_id: &str) -> Result<Vec<String>, WsError> {
        Ok(self.store.smembers(&user_rooms_key(user_id)).await?)
    }

    /// Drops the user's room index wholesale, the final step of disconnect
    /// cleanup.
    pub async fn clear_user(&self, user_id: &str) -> Result<(), WsError> {
        self.store.del(&user_rooms_key(user_id)).await?;
        Ok(())
    }
}

fn room_members_key(instance: &str) -> String {
    format!("ws_room:{instance}")
}

fn user_rooms_key(user_id: &str) -> String {
    format!("ws_user:{user_id}")
}
