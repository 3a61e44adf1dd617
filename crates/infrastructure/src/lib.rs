#![forbid(unsafe_code)]

pub mod config;
pub mod constants;
pub mod fragment_cache;
pub mod interfaces;
pub mod logging;
pub mod metrics;
