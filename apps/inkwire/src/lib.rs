pub mod client;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use client::CollabClient;
pub use config::{CacheDiscipline, CollabConfig};
pub use session::{Session, SessionRequest};
