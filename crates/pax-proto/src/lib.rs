pub mod catalog;
pub mod config;
pub mod error;
pub mod favorites;
pub mod platform;
pub mod protocol;
pub mod state;
