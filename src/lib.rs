pub mod config;
pub mod error;
pub mod i18n;
pub mod limit;
pub mod listener;
pub mod observability;
pub mod pipeline;
pub mod repository;
pub mod request;
pub mod router;
pub mod server;
pub mod store;
pub mod token;
