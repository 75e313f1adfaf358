pub mod client;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handlers;
pub mod mailbox;
pub mod rpc;
pub mod server;
pub mod session;

pub use client::RelayClient;
pub use error::ServerError;
pub use handlers::HandlerState;
pub use server::{start, ServerConfig, ServerHandle};
pub use session::{ConnectionHandle, Delivery, SessionRegistry};
