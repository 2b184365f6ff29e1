//! Route modules for the gateway API server.

pub mod admin;
pub mod health;
pub mod stream;
