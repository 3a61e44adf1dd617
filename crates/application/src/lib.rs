#![forbid(unsafe_code)]

pub mod config_reload;
pub mod nat_service_impl;
