// Farmus client - token lifecycle and authenticated access to the marketplace backend

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod http_client;
pub mod logging;
