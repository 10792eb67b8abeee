pub mod agent;
pub mod channels;
pub mod config;
pub mod error;
pub mod gateway;
pub mod providers;
pub mod security;
pub mod store;

pub use config::Config;
pub use error::{GatewayError, GatewayResult};
