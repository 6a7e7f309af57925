pub mod error;
pub mod types;
pub mod config;
pub mod session;
pub mod provider;
pub mod conversation;
pub mod channel;
pub mod service;
pub mod util;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");
