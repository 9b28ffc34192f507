pub mod access_key;
pub mod callback;
pub mod config;
pub mod db;
pub mod error;
pub mod issuance;
pub mod jobs;
pub mod models;
pub mod schema;
pub mod sequence;
pub mod services;
pub mod sri;
pub mod state;
pub mod storage;
pub mod store;
pub mod workers;

pub use workers::{default_handlers, Worker};
