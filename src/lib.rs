pub mod app;
pub mod bootstrap;
pub mod config;
pub mod constants;
pub mod domain;
pub mod error;
pub mod infra;
pub mod logging;
pub mod observability;
pub mod pipeline;
pub mod query;
pub mod server;
