pub mod auth;
pub mod cache;
pub mod db;
pub mod query;
pub mod security;
pub mod server;

pub use types;
