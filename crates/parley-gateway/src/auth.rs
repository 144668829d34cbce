use std::sync::Arc;

use jsonwebtoken::{DecodingKey, Validation, decode};
use tracing::warn;

use parley_store::Database;
use parley_types::api::Claims;
use parley_types::models::Principal;

/// Capabilities the session handshake consumes. Token issuance and group
/// administration live in external services; the gateway only resolves a
/// bearer token to a principal and asks whether that principal belongs to
/// a group.
pub trait AccessControl: Send + Sync {
    fn principal_for_token(&self, token: &str) -> Option<Principal>;
    fn is_member(&self, group_id: i64, user_id: i64) -> bool;
}

/// Production access control: decodes the bearer JWT and resolves the
/// principal and membership from the shared store.
pub struct TokenAccess {
    store: Arc<Database>,
    decoding_key: DecodingKey,
}

impl TokenAccess {
    pub fn new(store: Arc<Database>, jwt_secret: &str) -> Self {
        Self {
            store,
            decoding_key: DecodingKey::from_secret(jwt_secret.as_bytes()),
        }
    }
}

impl AccessControl for TokenAccess {
    fn principal_for_token(&self, token: &str) -> Option<Principal> {
        let data = decode::<Claims>(token, &self.decoding_key, &Validation::default()).ok()?;
        let user = match self.store.user_by_username(&data.claims.sub) {
            Ok(user) => user?,
            Err(e) => {
                warn!("principal lookup failed: {}", e);
                return None;
            }
        };
        if !user.is_active {
            return None;
        }
        Some(Principal {
            id: user.id,
            username: user.username,
        })
    }

    fn is_member(&self, group_id: i64, user_id: i64) -> bool {
        self.store.is_member(group_id, user_id).unwrap_or_else(|e| {
            warn!("membership check failed: {}", e);
            false
        })
    }
}
