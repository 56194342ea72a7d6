//! Fuzz target for control channel frames.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run control_message -- -max_total_time=300
//! ```

#![no_main]
use libfuzzer_sys::fuzz_target;
use n3ue_proto::ipsec::channel::{ControlFrame, ControlMessage};

fuzz_target!(|data: &[u8]| {
    if let Ok(frame) = ControlFrame::from_bytes(data) {
        let _ = ControlMessage::from_frame(&frame);
    }
    if let Ok(msg) = ControlMessage::from_bytes(data) {
        let encoded = msg.to_bytes().expect("Decoded message must encode");
        let again = ControlMessage::from_bytes(&encoded).expect("Re-encoded message must decode");
        assert_eq!(msg.name(), again.name());
    }
});
