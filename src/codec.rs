//! Wire codec and event identifiers shared by both the peripheral (NetSIO/UDP)
//! and host (custom-device/TCP) protocols.
//!
//! The peripheral wire has no length prefix: a UDP datagram's boundary is the
//! message boundary, `<id:u8><payload:bytes>`. The host wire is a fixed
//! 17-byte little-endian command header, decoded by [`HostHeader`].

use std::time::Instant;

/// Event and pseudo-event identifiers.
///
/// Ids below `0x100` are real NetSIO wire values (they fit in the `u8` that
/// goes on a UDP datagram). Ids at or above `0x100` are Altirra-specific
/// pseudo-events that only ever exist inside the hub process — they are
/// never written to a socket.
pub mod id {
    pub const DATA_BYTE: u16 = 0x01;
    pub const DATA_BLOCK: u16 = 0x02;
    pub const DATA_BYTE_SYNC: u16 = 0x09;
    pub const COMMAND_OFF: u16 = 0x10;
    pub const COMMAND_ON: u16 = 0x11;
    pub const COMMAND_OFF_SYNC: u16 = 0x18;
    pub const MOTOR_OFF: u16 = 0x20;
    pub const MOTOR_ON: u16 = 0x21;
    pub const PROCEED_OFF: u16 = 0x30;
    pub const PROCEED_ON: u16 = 0x31;
    pub const INTERRUPT_OFF: u16 = 0x40;
    pub const INTERRUPT_ON: u16 = 0x41;
    pub const SPEED_CHANGE: u16 = 0x80;
    pub const SYNC_RESPONSE: u16 = 0x81;
    pub const BUS_IDLE: u16 = 0x88;
    pub const CANCEL: u16 = 0x89; // not implemented
    pub const DEVICE_DISCONNECT: u16 = 0xC0;
    pub const DEVICE_CONNECT: u16 = 0xC1;
    pub const PING_REQUEST: u16 = 0xC2;
    pub const PING_RESPONSE: u16 = 0xC3;
    pub const ALIVE_REQUEST: u16 = 0xC4;
    pub const ALIVE_RESPONSE: u16 = 0xC5;
    pub const CREDIT_STATUS: u16 = 0xC6;
    pub const CREDIT_UPDATE: u16 = 0xC7;
    pub const WARM_RESET: u16 = 0xFE;
    pub const COLD_RESET: u16 = 0xFF;

    /// Ids at or above this value are connection management events and
    /// bypass the registration checks CONNECT/PING need to work.
    pub const CONN_MGMT: u16 = 0xC0;

    /// `NETSIO_SYNC_RESPONSE` payload byte 1: no ACK/NAK follows.
    pub const EMPTY_SYNC: u8 = 0x00;
    /// `NETSIO_SYNC_RESPONSE` payload byte 1: ACK/NAK and size follow.
    pub const ACK_SYNC: u8 = 0x01;

    // Altirra-specific pseudo-events, never on the wire.
    pub const ATDEV_READY: u16 = 0x100;
    pub const ATDEV_TRANSMIT_BUFFER: u16 = 0x101;
    pub const ATDEV_DEBUG_MESSAGE: u16 = 0x102;
    pub const ATDEV_DEBUG_NOP: u16 = 0x103;

    /// Returned to the emulator for a sync call with no ACK/NAK byte.
    pub const ATDEV_EMPTY_SYNC: i32 = 0x000;
}

/// A single SIO/NetSIO event, in either direction.
///
/// Immutable after construction except that the hub may append a single
/// sequence byte to an outbound sync request's payload.
#[derive(Debug, Clone)]
pub struct NetSioMsg {
    pub id: u16,
    pub arg: Vec<u8>,
    created_at: Instant,
}

impl NetSioMsg {
    pub fn new(id: u16) -> Self {
        Self { id, arg: Vec::new(), created_at: Instant::now() }
    }

    pub fn with_byte(id: u16, byte: u8) -> Self {
        Self { id, arg: vec![byte], created_at: Instant::now() }
    }

    pub fn with_arg(id: u16, arg: Vec<u8>) -> Self {
        Self { id, arg, created_at: Instant::now() }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Decode a single NetSIO UDP datagram. Returns `None` for an empty
    /// (zero-byte) datagram, which carries no event id.
    pub fn decode_udp(data: &[u8]) -> Option<Self> {
        let (&id_byte, arg) = data.split_first()?;
        Some(Self { id: u16::from(id_byte), arg: arg.to_vec(), created_at: Instant::now() })
    }

    /// Encode for the NetSIO UDP wire. Panics if `id` does not fit a `u8`
    /// (Altirra pseudo-events must never reach this path).
    pub fn encode_udp(&self) -> Vec<u8> {
        debug_assert!(self.id <= 0xFF, "pseudo-event id {:#x} leaked to the wire", self.id);
        let mut out = Vec::with_capacity(1 + self.arg.len());
        out.push(self.id as u8);
        out.extend_from_slice(&self.arg);
        out
    }
}

/// Length of the fixed host command header, `<cmd:u8><param1:u32><param2:i32><timestamp:u64>`.
pub const HOST_HEADER_LEN: usize = 17;

/// A decoded host command header.
#[derive(Debug, Clone, Copy)]
pub struct HostHeader {
    pub command: u8,
    pub param1: u32,
    pub param2: i32,
    pub timestamp: u64,
}

impl HostHeader {
    /// Decode the fixed 17-byte little-endian header.
    pub fn decode(bytes: [u8; HOST_HEADER_LEN]) -> Self {
        let command = bytes[0];
        let param1 = u32::from_le_bytes(bytes[1..5].try_into().expect("4-byte slice"));
        let param2 = i32::from_le_bytes(bytes[5..9].try_into().expect("4-byte slice"));
        let timestamp = u64::from_le_bytes(bytes[9..17].try_into().expect("8-byte slice"));
        Self { command, param1, param2, timestamp }
    }
}

/// Command ids the hub accepts from the emulator on the host channel.
pub mod host_command {
    pub const NONE: u8 = 0;
    pub const DEBUG_READ_BYTE: u8 = 1;
    pub const READ_BYTE: u8 = 2;
    pub const WRITE_BYTE: u8 = 3;
    pub const COLD_RESET: u8 = 4;
    pub const WARM_RESET: u8 = 5;
    pub const ERROR: u8 = 6;
    pub const SCRIPT_EVENT: u8 = 7;
    pub const SCRIPT_POST: u8 = 8;
}

/// Request ids the hub sends *to* the emulator, interleaved on the same
/// socket between commands it issues.
pub mod host_request {
    pub const ENABLE_LAYER: u8 = 2;
    pub const SET_LAYER_OFFSET: u8 = 3;
    pub const SET_LAYER_SEGMENT_AND_OFFSET: u8 = 4;
    pub const SET_LAYER_READONLY: u8 = 5;
    pub const READ_SEG_MEM: u8 = 6;
    pub const WRITE_SEG_MEM: u8 = 7;
    pub const COPY_SEG_MEM: u8 = 8;
    pub const INTERRUPT: u8 = 9;
}

/// Segment numbers used by the hub on the custom-device memory-segment ABI.
pub mod segment {
    /// The emulator's receive buffer (hub writes incoming SIO data here).
    pub const RX_BUFFER: u8 = 0;
    /// The transmit buffer (hub reads a synchronous DATA_BLOCK payload from here).
    pub const TX_BUFFER: u8 = 1;
    /// Debug/text buffer, unused by the hub's own logic.
    pub const DEBUG_TEXT: u8 = 2;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_udp_connect() {
        let msg = NetSioMsg::decode_udp(&[0xC1]).expect("non-empty datagram");
        assert_eq!(msg.id, id::DEVICE_CONNECT);
        assert!(msg.arg.is_empty());
    }

    #[test]
    fn test_decode_udp_empty_datagram_rejected() {
        assert!(NetSioMsg::decode_udp(&[]).is_none());
    }

    #[test]
    fn test_encode_udp_roundtrip() {
        let msg = NetSioMsg::with_arg(id::DATA_BLOCK, vec![0x41, 0x42, 0x43]);
        let bytes = msg.encode_udp();
        assert_eq!(bytes, vec![0x02, 0x41, 0x42, 0x43]);
        let decoded = NetSioMsg::decode_udp(&bytes).expect("roundtrip");
        assert_eq!(decoded.id, id::DATA_BLOCK);
        assert_eq!(decoded.arg, vec![0x41, 0x42, 0x43]);
    }

    #[test]
    fn test_host_header_decode() {
        let mut raw = [0u8; HOST_HEADER_LEN];
        raw[0] = host_command::SCRIPT_EVENT;
        raw[1..5].copy_from_slice(&0x18u32.to_le_bytes());
        raw[5..9].copy_from_slice(&(-1i32).to_le_bytes());
        raw[9..17].copy_from_slice(&0xDEAD_BEEFu64.to_le_bytes());

        let header = HostHeader::decode(raw);
        assert_eq!(header.command, host_command::SCRIPT_EVENT);
        assert_eq!(header.param1, 0x18);
        assert_eq!(header.param2, -1);
        assert_eq!(header.timestamp, 0xDEAD_BEEF);
    }

    #[test]
    fn test_connect_is_connection_management() {
        assert!(id::DEVICE_CONNECT >= id::CONN_MGMT);
        assert!(id::DATA_BYTE < id::CONN_MGMT);
    }
}
