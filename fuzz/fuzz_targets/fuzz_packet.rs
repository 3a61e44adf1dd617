#![no_main]

use libfuzzer_sys::fuzz_target;

use domain::nat::packet::Packet;

// Fuzz the IPv4 packet parser and every header accessor on what it accepts.
fuzz_target!(|data: &[u8]| {
    let Ok(packet) = Packet::parse(data.to_vec(), "fuzz0") else {
        return;
    };

    assert!(packet.len() <= data.len());
    assert!(packet.header_len() <= packet.len());

    let _ = packet.protocol();
    let _ = (packet.src(), packet.dst(), packet.ident());
    let _ = (packet.is_fragment(), packet.is_first_fragment());
    let _ = (packet.src_port(), packet.dst_port());
    let _ = (packet.icmp_type(), packet.icmp_code(), packet.icmp_id());
    let _ = (packet.is_icmp_error(), packet.tcp_flags());
    let _ = packet.transport_len();
});
