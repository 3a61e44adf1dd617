pub mod fragment_cache;
pub mod interface_address;
pub mod metrics_port;
pub mod protocol_proxy;
