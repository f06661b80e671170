//! External Redis backend for the query cache

mod client;

pub use client::RedisCacheStore;
