pub mod api;
pub mod app;
pub mod clock;
pub mod config;
pub mod health;
pub mod ingest;
pub mod migrate;
pub mod rollup;
pub mod store;
