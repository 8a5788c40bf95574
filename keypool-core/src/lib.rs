//! Token-aware selection of upstream API keys.
//!
//! Each key has a token bucket kept in a shared store (Valkey in production). A
//! selection samples the active keys, weighs them by remaining tokens and reserves
//! tokens on the winner with one atomic store call. When the store cannot help, the
//! selector degrades to a uniform-random pick so that requests keep flowing.

pub mod admin;
pub mod bucket;
pub mod bucket_manager;
pub mod cache;
pub mod config;
pub mod db;
pub mod endpoints;
pub mod error;
pub mod observability;
pub mod pool;
pub mod selection;
pub mod tasks;
pub mod utils;
