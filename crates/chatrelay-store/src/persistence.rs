//! The persistence boundary the relay server talks to.

use tracing::{info, instrument};

use chatrelay_core::UserId;

use crate::database::Database;
use crate::error::StoreError;
use crate::messages::{HistoryEntry, MessageRepo, NewMessage, RecentChat, StoredMessage};
use crate::password;
use crate::users::{UserProfile, UserRepo, UserSummary};

/// Durable state behind the relay: accounts, credentials, profiles and chat
/// history. Synchronous; every failure comes back as a `StoreError` whose
/// text is safe to show to the requesting client.
pub trait Persistence: Send + Sync {
    fn register(
        &self,
        display_name: &str,
        email: &str,
        password: &str,
    ) -> Result<UserId, StoreError>;

    /// Check credentials and return the account on success.
    fn authenticate(&self, email: &str, password: &str) -> Result<UserProfile, StoreError>;

    fn user_summary(&self, user_id: UserId) -> Result<UserSummary, StoreError>;

    fn list_users(&self) -> Result<Vec<UserSummary>, StoreError>;

    fn save_message(&self, message: NewMessage<'_>) -> Result<StoredMessage, StoreError>;

    fn chat_history(
        &self,
        user_id: UserId,
        peer_id: UserId,
    ) -> Result<Vec<HistoryEntry>, StoreError>;

    fn recent_chats(&self, user_id: UserId) -> Result<Vec<RecentChat>, StoreError>;

    fn profile(&self, user_id: UserId) -> Result<UserProfile, StoreError>;

    fn update_profile(
        &self,
        user_id: UserId,
        display_name: Option<&str>,
        avatar: Option<&str>,
    ) -> Result<(), StoreError>;

    fn change_password(
        &self,
        user_id: UserId,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), StoreError>;
}

/// SQLite-backed `Persistence`.
pub struct SqliteStore {
    users: UserRepo,
    messages: MessageRepo,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self {
            users: UserRepo::new(db.clone()),
            messages: MessageRepo::new(db),
        }
    }
}

fn require_non_empty(value: &str, field: &str) -> Result<(), StoreError> {
    if value.trim().is_empty() {
        return Err(StoreError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}

impl Persistence for SqliteStore {
    #[instrument(skip(self, password))]
    fn register(
        &self,
        display_name: &str,
        email: &str,
        password: &str,
    ) -> Result<UserId, StoreError> {
        require_non_empty(display_name, "display_name")?;
        require_non_empty(email, "email")?;
        require_non_empty(password, "password")?;

        let hash = password::hash_password(password);
        let id = self.users.create(display_name.trim(), email.trim(), &hash)?;
        info!(user_id = %id, "user registered");
        Ok(id)
    }

    #[instrument(skip(self, password))]
    fn authenticate(&self, email: &str, password: &str) -> Result<UserProfile, StoreError> {
        let row = self
            .users
            .find_by_email(email.trim())?
            .ok_or_else(|| StoreError::NotFound("account".into()))?;
        if !password::verify_password(password, &row.password_hash) {
            return Err(StoreError::InvalidCredentials("wrong password".into()));
        }
        Ok(row.profile())
    }

    fn user_summary(&self, user_id: UserId) -> Result<UserSummary, StoreError> {
        Ok(self.users.get(user_id)?.summary())
    }

    fn list_users(&self) -> Result<Vec<UserSummary>, StoreError> {
        self.users.list()
    }

    fn save_message(&self, message: NewMessage<'_>) -> Result<StoredMessage, StoreError> {
        self.messages.insert(message)
    }

    fn chat_history(
        &self,
        user_id: UserId,
        peer_id: UserId,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        self.messages.history(user_id, peer_id)
    }

    fn recent_chats(&self, user_id: UserId) -> Result<Vec<RecentChat>, StoreError> {
        self.messages.recent(user_id)
    }

    fn profile(&self, user_id: UserId) -> Result<UserProfile, StoreError> {
        Ok(self.users.get(user_id)?.profile())
    }

    fn update_profile(
        &self,
        user_id: UserId,
        display_name: Option<&str>,
        avatar: Option<&str>,
    ) -> Result<(), StoreError> {
        if let Some(name) = display_name {
            require_non_empty(name, "display_name")?;
        }
        self.users.update_profile(user_id, display_name.map(str::trim), avatar)
    }

    #[instrument(skip(self, old_password, new_password), fields(user_id = %user_id))]
    fn change_password(
        &self,
        user_id: UserId,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), StoreError> {
        require_non_empty(new_password, "new_password")?;
        let row = self.users.get(user_id)?;
        if !password::verify_password(old_password, &row.password_hash) {
            return Err(StoreError::InvalidCredentials("current password is incorrect".into()));
        }
        self.users
            .set_password_hash(user_id, &password::hash_password(new_password))?;
        info!(user_id = %user_id, "password changed");
        Ok(())
    }
}
