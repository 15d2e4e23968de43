// OAuth2 Keeper - Library root

pub mod auth;
pub mod config;
pub mod error;
pub mod http_client;
pub mod store;
