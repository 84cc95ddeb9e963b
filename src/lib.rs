pub mod apps;
pub mod broker;
pub mod config;
pub mod coordinator;
pub mod logger;
pub mod pending;
pub mod schema;
pub mod transport;
pub mod ws;
