use chrono::Utc;
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use chatrelay_core::UserId;

use crate::database::Database;
use crate::error::StoreError;

/// Public view of a user, as listed to other users.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserSummary {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar: Option<String>,
}

/// A user's own profile.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    pub display_name: String,
    pub email: String,
    pub avatar: Option<String>,
}

/// Full row including the password hash. Never leaves the store crate.
#[derive(Clone, Debug)]
pub(crate) struct UserRow {
    pub id: UserId,
    pub display_name: String,
    pub email: String,
    pub password_hash: String,
    pub avatar: Option<String>,
}

impl UserRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: UserId::new(row.get(0)?),
            display_name: row.get(1)?,
            email: row.get(2)?,
            password_hash: row.get(3)?,
            avatar: row.get(4)?,
        })
    }

    pub fn profile(&self) -> UserProfile {
        UserProfile {
            user_id: self.id,
            display_name: self.display_name.clone(),
            email: self.email.clone(),
            avatar: self.avatar.clone(),
        }
    }

    pub fn summary(&self) -> UserSummary {
        UserSummary {
            user_id: self.id,
            display_name: self.display_name.clone(),
            avatar: self.avatar.clone(),
        }
    }
}

const USER_COLUMNS: &str = "id, display_name, email, password_hash, avatar";

pub struct UserRepo {
    db: Database,
}

impl UserRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a user. The email must not be registered yet.
    #[instrument(skip(self, password_hash))]
    pub(crate) fn create(
        &self,
        display_name: &str,
        email: &str,
        password_hash: &str,
    ) -> Result<UserId, StoreError> {
        self.db.with_conn(|conn| {
            let exists: Option<i64> = conn
                .query_row("SELECT id FROM users WHERE email = ?1", [email], |row| row.get(0))
                .optional()?;
            if exists.is_some() {
                return Err(StoreError::Conflict("email already registered".into()));
            }

            conn.execute(
                "INSERT INTO users (display_name, email, password_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![display_name, email, password_hash, Utc::now().to_rfc3339()],
            )?;
            Ok(UserId::new(conn.last_insert_rowid()))
        })
    }

    #[instrument(skip(self))]
    pub(crate) fn find_by_email(&self, email: &str) -> Result<Option<UserRow>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1");
            Ok(conn.query_row(&sql, [email], UserRow::from_row).optional()?)
        })
    }

    #[instrument(skip(self), fields(user_id = %id))]
    pub(crate) fn get(&self, id: UserId) -> Result<UserRow, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1");
            conn.query_row(&sql, [id.get()], UserRow::from_row)
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("user {id}")))
        })
    }

    /// All users, oldest account first.
    #[instrument(skip(self))]
    pub fn list(&self) -> Result<Vec<UserSummary>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, display_name, avatar FROM users ORDER BY id")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(UserSummary {
                        user_id: UserId::new(row.get(0)?),
                        display_name: row.get(1)?,
                        avatar: row.get(2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Update whichever of the two profile fields is given.
    #[instrument(skip(self, avatar), fields(user_id = %id))]
    pub fn update_profile(
        &self,
        id: UserId,
        display_name: Option<&str>,
        avatar: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut sets = Vec::new();
        let mut values: Vec<&dyn rusqlite::types::ToSql> = Vec::new();
        if let Some(name) = display_name.as_ref() {
            sets.push(format!("display_name = ?{}", values.len() + 1));
            values.push(name);
        }
        if let Some(data) = avatar.as_ref() {
            sets.push(format!("avatar = ?{}", values.len() + 1));
            values.push(data);
        }
        if sets.is_empty() {
            return Err(StoreError::Validation("nothing to update".into()));
        }

        let raw_id = id.get();
        let sql = format!(
            "UPDATE users SET {} WHERE id = ?{}",
            sets.join(", "),
            values.len() + 1
        );
        values.push(&raw_id);

        self.db.with_conn(|conn| {
            let changed = conn.execute(&sql, values.as_slice())?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("user {id}")));
            }
            Ok(())
        })
    }

    #[instrument(skip(self, password_hash), fields(user_id = %id))]
    pub(crate) fn set_password_hash(
        &self,
        id: UserId,
        password_hash: &str,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users SET password_hash = ?1 WHERE id = ?2",
                rusqlite::params![password_hash, id.get()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("user {id}")));
            }
            Ok(())
        })
    }
}
