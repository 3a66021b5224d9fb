pub mod config;
pub mod error;
pub mod hw;
pub mod messages;
pub mod motor;
pub mod runtime;
