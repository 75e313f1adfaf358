pub mod database;
pub mod error;
pub mod messages;
pub mod password;
pub mod persistence;
pub mod schema;
pub mod users;

pub use database::Database;
pub use error::StoreError;
pub use messages::{HistoryEntry, NewMessage, RecentChat, StoredMessage};
pub use persistence::{Persistence, SqliteStore};
pub use users::{UserProfile, UserSummary};
