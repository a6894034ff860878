pub mod auth;
pub mod calendar;
pub mod compactor;
pub mod config;
pub mod department;
pub mod engine;
pub mod limits;
pub mod model;
pub mod observability;
pub mod sql;
pub mod store;
pub mod tls;
pub mod token;
pub mod wal;
pub mod wire;
