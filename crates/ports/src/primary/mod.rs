pub mod nat_packet_port;
