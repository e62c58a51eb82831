pub mod auth;
pub mod config;
pub mod schemas;
pub mod shutdown;
pub mod state;
