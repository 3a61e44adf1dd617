pub mod aging;
pub mod allocator;
pub mod checksum;
pub mod engine;
pub mod entity;
pub mod error;
pub mod hostmap;
pub mod icmp;
pub mod packet;
pub mod rules;
pub mod table;
