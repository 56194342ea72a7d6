//! Fuzz target for IKEv2 message parsing.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run ike_message -- -max_total_time=300
//! ```

#![no_main]
use libfuzzer_sys::fuzz_target;
use n3ue_proto::ipsec::ikev2::{exchange::ExchangePayloads, message::IkeMessage};

fuzz_target!(|data: &[u8]| {
    if let Ok(mut msg) = IkeMessage::from_bytes(data) {
        let _ = ExchangePayloads::collect(&msg.payloads);
        if let Ok(serialized) = msg.to_bytes() {
            let reparsed =
                IkeMessage::from_bytes(&serialized).expect("Re-encoded message must parse");
            assert_eq!(msg.payloads.len(), reparsed.payloads.len());
        }
    }
});
