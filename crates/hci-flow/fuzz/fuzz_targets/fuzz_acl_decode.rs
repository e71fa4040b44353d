#![no_main]

use libfuzzer_sys::fuzz_target;
use hci_flow::AclPacket;

/// Fuzz the ACL frame decoder.
///
/// Decoding must never panic, and anything it accepts must re-encode to the
/// exact bytes it consumed.
fuzz_target!(|data: &[u8]| {
    let mut buf = data;
    if let Some(packet) = AclPacket::decode(&mut buf) {
        let consumed = data.len() - buf.len();
        let wire = packet.encode();
        assert_eq!(&wire[..], &data[..consumed]);
    }
});
