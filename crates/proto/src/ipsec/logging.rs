//! Structured logging for UE operations
//!
//! Provides structured, contextual logging using the `tracing` framework.
//! All log messages include relevant context fields for debugging. Key
//! material is never logged, only SPIs and lengths.
//!
//! # Log Levels
//!
//! - **TRACE**: Raw message sizes
//! - **DEBUG**: ESP packet processing, NAS and EAP rounds, reassembly
//! - **INFO**: State transitions, handshake events, SA lifecycle
//! - **WARN**: Retries, stale packets, evictions
//! - **ERROR**: Failed operations, authentication failures
//!
//! # Example
//!
//! ```no_run
//! use n3ue_proto::ipsec::logging;
//! use n3ue_proto::ipsec::ikev2::UeState;
//!
//! tracing_subscriber::fmt()
//!     .with_env_filter("n3ue_proto=debug")
//!     .init();
//!
//! logging::log_state_transition(UeState::Init, UeState::Auth1);
//! ```

use tracing::{debug, error, info, trace, warn};

use crate::ipsec::ikev2::state::UeState;

/// Log exchange state transition
///
/// # Arguments
///
/// * `from` - Previous state
/// * `to` - New state
pub fn log_state_transition(from: UeState, to: UeState) {
    info!(state_from = %from, state_to = %to, "UE state transition");
}

/// Log IKE SA establishment
///
/// # Arguments
///
/// * `spi_i` - Initiator SPI
/// * `spi_r` - Responder SPI
/// * `suite` - Negotiated algorithms, human readable
pub fn log_ike_sa_established(spi_i: &[u8], spi_r: &[u8], suite: &str) {
    info!(
        ike_spi_i = %hex::encode(spi_i),
        ike_spi_r = %hex::encode(spi_r),
        suite = suite,
        "IKE SA keys derived"
    );
}

/// Log ESP packet processing
///
/// # Arguments
///
/// * `operation` - "encrypt" or "decrypt"
/// * `spi` - ESP Security Parameter Index
/// * `seq` - Sequence number
/// * `payload_len` - Payload length in bytes
pub fn log_esp_packet(operation: &str, spi: u32, seq: u32, payload_len: usize) {
    debug!(
        operation = operation,
        child_spi = %format!("{:#010x}", spi),
        seq_num = seq,
        payload_len = payload_len,
        "ESP packet processed"
    );
}

/// Log handshake start
///
/// # Arguments
///
/// * `peer_addr` - Gateway address and port
/// * `variant` - "NWu" or "SWu"
pub fn log_handshake_start(peer_addr: &str, variant: &str) {
    info!(peer = peer_addr, variant = variant, "IKE handshake started");
}

/// Log handshake completion
///
/// # Arguments
///
/// * `peer_addr` - Gateway address and port
/// * `duration_ms` - Time from first IKE_SA_INIT to CONNECTED
pub fn log_handshake_complete(peer_addr: &str, duration_ms: u64) {
    info!(
        peer = peer_addr,
        duration_ms = duration_ms,
        "IKE handshake completed successfully"
    );
}

/// Log handshake failure
///
/// # Arguments
///
/// * `peer_addr` - Gateway address and port
/// * `error` - Error message
pub fn log_handshake_failed(peer_addr: &str, error: &str) {
    error!(peer = peer_addr, error = error, "IKE handshake failed");
}

/// Log a retried exchange step
///
/// # Arguments
///
/// * `step` - State being retried
/// * `attempt` - Attempt number, starting at 1
/// * `reason` - Why the step is repeated
pub fn log_retry(step: UeState, attempt: u32, reason: &str) {
    warn!(step = %step, attempt = attempt, reason = reason, "Repeating exchange step");
}

/// Log IKE SA rekey start
///
/// # Arguments
///
/// * `old_spi_i` - Old initiator SPI
/// * `old_spi_r` - Old responder SPI
pub fn log_ike_rekey_start(old_spi_i: &[u8], old_spi_r: &[u8]) {
    info!(
        old_spi_i = %hex::encode(old_spi_i),
        old_spi_r = %hex::encode(old_spi_r),
        "IKE SA rekey started"
    );
}

/// Log IKE SA rekey completion
///
/// # Arguments
///
/// * `old_spi_i` - Old initiator SPI
/// * `new_spi_i` - New initiator SPI
/// * `new_spi_r` - New responder SPI
pub fn log_ike_rekey_complete(old_spi_i: &[u8], new_spi_i: &[u8], new_spi_r: &[u8]) {
    info!(
        old_spi_i = %hex::encode(old_spi_i),
        new_spi_i = %hex::encode(new_spi_i),
        new_spi_r = %hex::encode(new_spi_r),
        "IKE SA rekey completed successfully"
    );
}

/// Log Child SA creation
///
/// # Arguments
///
/// * `spi_in` - Inbound SPI (chosen locally)
/// * `spi_out` - Outbound SPI (chosen by the gateway)
/// * `user_plane` - Whether the SA carries the 5G user plane
pub fn log_child_sa_created(spi_in: u32, spi_out: u32, user_plane: bool) {
    info!(
        spi_in = %format!("{:#010x}", spi_in),
        spi_out = %format!("{:#010x}", spi_out),
        user_plane = user_plane,
        "Child SA created"
    );
}

/// Log Child SA rekey start
pub fn log_child_rekey_start(old_spi: u32) {
    info!(old_child_spi = %format!("{:#010x}", old_spi), "Child SA rekey started");
}

/// Log Child SA rekey completion
///
/// # Arguments
///
/// * `old_spi` - Old inbound SPI
/// * `new_spi` - New inbound SPI
pub fn log_child_rekey_complete(old_spi: u32, new_spi: u32) {
    info!(
        old_child_spi = %format!("{:#010x}", old_spi),
        new_child_spi = %format!("{:#010x}", new_spi),
        "Child SA rekey completed successfully"
    );
}

/// Log Child SA deletion
///
/// # Arguments
///
/// * `child_spi` - Child SA SPI
/// * `reason` - Deletion reason (e.g., "shutdown", "rekey", "peer")
pub fn log_child_sa_deleted(child_spi: u32, reason: &str) {
    info!(child_spi = %format!("{:#010x}", child_spi), reason = reason, "Child SA deleted");
}

/// Log proposal negotiation
///
/// # Arguments
///
/// * `offered` - Number of proposals offered
/// * `chosen_id` - Number of the proposal the peer accepted, if any
pub fn log_proposal_negotiation(offered: usize, chosen_id: Option<u8>) {
    match chosen_id {
        Some(id) => debug!(
            proposals_offered = offered,
            chosen_id = id,
            "Proposal negotiation successful"
        ),
        None => warn!(
            proposals_offered = offered,
            "Proposal negotiation failed - no acceptable proposal"
        ),
    }
}

/// Log an SA update pushed to or applied by a worker
///
/// # Arguments
///
/// * `operation` - "create", "update" or "delete"
/// * `spi` - Inbound SPI of the SA
/// * `epoch` - Key epoch carried by the update
pub fn log_sa_update(operation: &str, spi: u32, epoch: u64) {
    info!(
        operation = operation,
        spi = %format!("{:#010x}", spi),
        epoch = epoch,
        "SA update"
    );
}

/// Log a data packet dropped because it was queued under older keys
pub fn log_stale_packet(spi: u32, packet_epoch: u64, current_epoch: u64) {
    warn!(
        spi = %format!("{:#010x}", spi),
        packet_epoch = packet_epoch,
        current_epoch = current_epoch,
        "Dropping packet queued under superseded keys"
    );
}

/// Log completion of IP fragment reassembly
///
/// # Arguments
///
/// * `identification` - IP identification field
/// * `fragments` - Number of fragments joined
/// * `total_len` - Reassembled datagram length
pub fn log_reassembly(identification: u16, fragments: usize, total_len: usize) {
    debug!(
        identification = identification,
        fragments = fragments,
        total_len = total_len,
        "IP datagram reassembled"
    );
}

/// Log eviction of incomplete fragment sets
pub fn log_reassembly_evicted(count: usize) {
    warn!(count = count, "Evicted incomplete fragment sets");
}

/// Log a NAS message passing through the UE
///
/// # Arguments
///
/// * `direction` - "uplink" or "downlink"
/// * `message_type` - 5GMM/5GSM message type octet
/// * `len` - PDU length in bytes
pub fn log_nas_message(direction: &str, message_type: u8, len: usize) {
    debug!(
        direction = direction,
        message_type = %format!("{:#04x}", message_type),
        len = len,
        "NAS message"
    );
}

/// Log an EAP round
///
/// # Arguments
///
/// * `code` - EAP code
/// * `method` - EAP type, 0 for Success/Failure
/// * `subtype` - AKA subtype or EAP-5G message id
pub fn log_eap_round(code: u8, method: u8, subtype: u8) {
    debug!(code = code, method = method, subtype = subtype, "EAP round");
}

/// Log an operator command
pub fn log_operator_command(command: &str) {
    info!(command = command, "Operator command");
}

/// Log authentication success
///
/// # Arguments
///
/// * `peer_id` - Peer identity
/// * `auth_method` - Authentication method used (e.g., "EAP-AKA'", "EAP-5G")
pub fn log_authentication_success(peer_id: &str, auth_method: &str) {
    info!(
        peer_id = peer_id,
        auth_method = auth_method,
        "Peer authenticated successfully"
    );
}

/// Log authentication failure
///
/// # Arguments
///
/// * `peer_id` - Peer identity
/// * `reason` - Failure reason
pub fn log_authentication_failed(peer_id: &str, reason: &str) {
    error!(peer_id = peer_id, reason = reason, "Peer authentication failed");
}

/// Log generic error with context
///
/// # Arguments
///
/// * `context` - Context where error occurred (e.g., "IKE_SA_INIT", "ESP decrypt")
/// * `error` - Error message
pub fn log_error(context: &str, error: &str) {
    error!(context = context, error = error, "UE error occurred");
}

/// Log protocol message send
///
/// # Arguments
///
/// * `msg_type` - Exchange name (e.g., "IKE_SA_INIT", "IKE_AUTH")
/// * `peer_addr` - Peer address
/// * `size_bytes` - Message size in bytes
pub fn log_message_send(msg_type: &str, peer_addr: &str, size_bytes: usize) {
    trace!(
        msg_type = msg_type,
        peer = peer_addr,
        size_bytes = size_bytes,
        "Sending IKE message"
    );
}

/// Log protocol message receive
///
/// # Arguments
///
/// * `msg_type` - Exchange name (e.g., "IKE_SA_INIT", "IKE_AUTH")
/// * `peer_addr` - Peer address
/// * `size_bytes` - Message size in bytes
pub fn log_message_recv(msg_type: &str, peer_addr: &str, size_bytes: usize) {
    trace!(
        msg_type = msg_type,
        peer = peer_addr,
        size_bytes = size_bytes,
        "Received IKE message"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_functions() {
        // No subscriber installed; this only exercises the call paths
        log_state_transition(UeState::Init, UeState::Auth1);
        log_ike_sa_established(&[1; 8], &[2; 8], "AES_CBC_128/HMAC_SHA1_96");
        log_esp_packet("encrypt", 0x12345678, 100, 1500);

        log_handshake_start("10.0.0.1:500", "NWu");
        log_handshake_complete("10.0.0.1:500", 150);
        log_handshake_failed("10.0.0.1:500", "timeout");
        log_retry(UeState::Auth2, 1, "synch failure");

        log_ike_rekey_start(&[0x01, 0x02], &[0x03, 0x04]);
        log_ike_rekey_complete(&[0x01, 0x02], &[0x05, 0x06], &[0x07, 0x08]);

        log_child_sa_created(1, 2, false);
        log_child_rekey_start(1);
        log_child_rekey_complete(1, 3);
        log_child_sa_deleted(3, "shutdown");

        log_proposal_negotiation(2, Some(1));
        log_proposal_negotiation(2, None);

        log_sa_update("update", 3, 2);
        log_stale_packet(3, 1, 2);
        log_reassembly(0x1234, 3, 3000);
        log_reassembly_evicted(2);
        log_nas_message("uplink", 0x41, 40);
        log_eap_round(1, 50, 1);
        log_operator_command("rekey-child");

        log_authentication_success("n3iwf", "EAP-5G");
        log_authentication_failed("n3iwf", "AUTH mismatch");
        log_error("ESP decrypt", "integrity check failed");
        log_message_send("IKE_SA_INIT", "10.0.0.1:500", 256);
        log_message_recv("IKE_SA_INIT", "10.0.0.1:500", 256);
    }
}
