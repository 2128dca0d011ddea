pub mod broadcast;
pub mod client;
pub mod consumer;
pub mod error;
pub mod http;
pub mod protocol;
pub mod server;
pub mod service;
pub mod ticker;

pub use error::ServerError;
pub use server::{start, ServerConfig, ServerHandle};
pub use service::RaceService;
