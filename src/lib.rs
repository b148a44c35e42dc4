pub mod accounts;
pub mod app;
pub mod chat;
pub mod config;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod meter;
pub mod providers;
pub mod quota;
pub mod registry;
pub mod search;
pub mod stream;
pub mod telemetry;
