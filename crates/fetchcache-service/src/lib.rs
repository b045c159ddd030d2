#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod fetcher;
pub mod utils;
