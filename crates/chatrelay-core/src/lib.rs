pub mod envelope;
pub mod ids;

pub use envelope::{Envelope, MessageKind};
pub use ids::{ConnectionId, UserId};
