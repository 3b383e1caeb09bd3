//! Database queries for the signaling service.

use homeport_core::db::{unix_timestamp, DatabaseError};

use super::models::{Device, User};
use super::SignalingDatabase;

impl SignalingDatabase {
    // =========================================================================
    // User queries
    // =========================================================================

    /// Create a new user. Fails on duplicate email (unique constraint).
    pub async fn create_user(
        &self,
        email: &str,
        password_hash: &str,
    ) -> Result<User, DatabaseError> {
        let now = unix_timestamp();

        let result = sqlx::query(
            "INSERT INTO users (email, password_hash, created_at) VALUES (?, ?, ?)",
        )
        .bind(email)
        .bind(password_hash)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_user(result.last_insert_rowid()).await
    }

    /// Get a user by ID.
    pub async fn get_user(&self, id: i64) -> Result<User, DatabaseError> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("User {id}")))
    }

    /// Get a user by email.
    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, DatabaseError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(self.pool())
            .await?;
        Ok(user)
    }

    // =========================================================================
    // Device queries
    // =========================================================================

    /// Register or refresh a device (idempotent upsert).
    ///
    /// Re-registration by the same owner updates the pubkey and `last_seen`.
    /// The caller is responsible for rejecting ids owned by another user.
    pub async fn upsert_device(
        &self,
        id: &str,
        user_id: i64,
        pubkey: &str,
    ) -> Result<Device, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            "INSERT INTO devices (id, user_id, pubkey, created_at, last_seen) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET pubkey = excluded.pubkey, last_seen = excluded.last_seen",
        )
        .bind(id)
        .bind(user_id)
        .bind(pubkey)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_device(id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Device {id}")))
    }

    /// Get a device by ID.
    pub async fn get_device(&self, id: &str) -> Result<Option<Device>, DatabaseError> {
        let device = sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(device)
    }

    /// List all devices owned by a user.
    pub async fn list_devices(&self, user_id: i64) -> Result<Vec<Device>, DatabaseError> {
        let devices = sqlx::query_as::<_, Device>(
            "SELECT * FROM devices WHERE user_id = ? ORDER BY created_at",
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;
        Ok(devices)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_get_user() {
        let db = SignalingDatabase::open_in_memory().await.unwrap();
        let user = db.create_user("alice@example.com", "hash").await.unwrap();

        assert_eq!(user.email, "alice@example.com");
        assert!(user.id > 0);

        let found = db.get_user_by_email("alice@example.com").await.unwrap();
        assert_eq!(found.unwrap().id, user.id);

        let missing = db.get_user_by_email("bob@example.com").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn duplicate_email_rejected() {
        let db = SignalingDatabase::open_in_memory().await.unwrap();
        db.create_user("alice@example.com", "hash").await.unwrap();

        let result = db.create_user("alice@example.com", "other-hash").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn device_upsert_is_idempotent() {
        let db = SignalingDatabase::open_in_memory().await.unwrap();
        let user = db.create_user("alice@example.com", "hash").await.unwrap();

        let d1 = db.upsert_device("host-1", user.id, "pk-1").await.unwrap();
        assert_eq!(d1.pubkey, "pk-1");

        // Re-registration refreshes the pubkey without failing.
        let d2 = db.upsert_device("host-1", user.id, "pk-2").await.unwrap();
        assert_eq!(d2.id, "host-1");
        assert_eq!(d2.pubkey, "pk-2");
        assert_eq!(d2.created_at, d1.created_at);

        let devices = db.list_devices(user.id).await.unwrap();
        assert_eq!(devices.len(), 1);
    }

    #[tokio::test]
    async fn list_devices_scoped_to_owner() {
        let db = SignalingDatabase::open_in_memory().await.unwrap();
        let alice = db.create_user("alice@example.com", "hash").await.unwrap();
        let bob = db.create_user("bob@example.com", "hash").await.unwrap();

        db.upsert_device("host-a", alice.id, "pk").await.unwrap();
        db.upsert_device("browser-a", alice.id, "pk").await.unwrap();
        db.upsert_device("host-b", bob.id, "pk").await.unwrap();

        let devices = db.list_devices(alice.id).await.unwrap();
        let mut ids: Vec<_> = devices.iter().map(|d| d.id.as_str()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["browser-a", "host-a"]);
    }
}
