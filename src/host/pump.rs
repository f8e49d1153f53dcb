//! Host outbound pump: drains the hub's host-bound queue and translates each
//! event into one or two custom-device ABI calls against the emulator.

use std::sync::Arc;

use log::{trace, warn};

use crate::codec::id;
use crate::codec::segment;
use crate::codec::NetSioMsg;
use crate::constants::READY_TO_RECEIVE_TIMEOUT;
use crate::hub::Hub;

use super::{HostConn, ReadyGate};

const ATDEV_TRANSMIT_BUFFER_MARKER: u32 = id::ATDEV_TRANSMIT_BUFFER as u32;

pub struct HostPump {
    conn: Arc<HostConn>,
    ready: Arc<ReadyGate>,
    hub: Arc<Hub>,
}

impl HostPump {
    pub fn new(conn: Arc<HostConn>, ready: Arc<ReadyGate>, hub: Arc<Hub>) -> Self {
        Self { conn, ready, hub }
    }

    pub fn run(&self) {
        while self.hub.host_connected() {
            let Some(msg) = self.hub.host_queue().pop_timeout(std::time::Duration::from_millis(200)) else {
                continue;
            };

            if !self.ready.wait(READY_TO_RECEIVE_TIMEOUT) {
                warn!("ready-to-receive timed out, recovering");
                self.hub.host_queue().clear();
                self.ready.set();
                continue;
            }

            if self.hub.host_queue().len() < 2 {
                self.hub.credit_clients();
            }

            if matches!(msg.id, id::DATA_BYTE | id::DATA_BLOCK | id::BUS_IDLE) {
                self.ready.clear();
            }

            if let Err(err) = self.send(msg) {
                warn!("host outbound send failed: {err:#}");
            }
        }
    }

    fn send(&self, msg: NetSioMsg) -> anyhow::Result<()> {
        match msg.id {
            id::DATA_BLOCK if msg.arg.len() <= 6 => {
                let (aux1, aux2) = pack_inline_data_block(&msg.arg);
                self.conn.interrupt(aux1, aux2)
            }
            id::DATA_BLOCK => {
                self.conn.write_seg_mem(segment::RX_BUFFER, 0, &msg.arg)?;
                self.conn.interrupt(ATDEV_TRANSMIT_BUFFER_MARKER, msg.arg.len() as u32)
            }
            id::DATA_BYTE => {
                let byte = msg.arg.first().copied().unwrap_or(0);
                self.conn.interrupt(u32::from(id::DATA_BYTE), u32::from(byte))
            }
            id::SPEED_CHANGE => {
                let baud = le_u32(&msg.arg);
                self.conn.interrupt(u32::from(id::SPEED_CHANGE), baud)
            }
            id::BUS_IDLE => {
                let duration = le_u16(&msg.arg);
                self.conn.interrupt(u32::from(id::BUS_IDLE), u32::from(duration))
            }
            other => {
                trace!("pumping event id={other:#x}");
                let value = msg.arg.first().copied().unwrap_or(0);
                self.conn.interrupt(u32::from(other), u32::from(value))
            }
        }
    }
}

/// Pack a DATA_BLOCK of at most 6 bytes into a single INTERRUPT call's aux
/// words: `aux1` carries the transmit-buffer marker, the block length, and
/// the first two data bytes; `aux2` carries the remaining up to four bytes.
fn pack_inline_data_block(bytes: &[u8]) -> (u32, u32) {
    let len = bytes.len() as u32;
    let b0 = u32::from(bytes.first().copied().unwrap_or(0));
    let b1 = u32::from(bytes.get(1).copied().unwrap_or(0));
    let aux1 = ATDEV_TRANSMIT_BUFFER_MARKER | (len << 9) | (b0 << 16) | (b1 << 24);

    let mut rest = [0u8; 4];
    for (i, slot) in rest.iter_mut().enumerate() {
        *slot = bytes.get(2 + i).copied().unwrap_or(0);
    }
    let aux2 = u32::from_le_bytes(rest);
    (aux1, aux2)
}

fn le_u32(arg: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    let len = arg.len().min(4);
    bytes[..len].copy_from_slice(&arg[..len]);
    u32::from_le_bytes(bytes)
}

fn le_u16(arg: &[u8]) -> u16 {
    let mut bytes = [0u8; 2];
    let len = arg.len().min(2);
    bytes[..len].copy_from_slice(&arg[..len]);
    u16::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_inline_data_block_layout() {
        let (aux1, aux2) = pack_inline_data_block(&[0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        assert_eq!(aux1 & 0x1FF, ATDEV_TRANSMIT_BUFFER_MARKER);
        assert_eq!((aux1 >> 9) & 0x7F, 6);
        assert_eq!((aux1 >> 16) & 0xFF, 0x11);
        assert_eq!((aux1 >> 24) & 0xFF, 0x22);
        assert_eq!(aux2, u32::from_le_bytes([0x33, 0x44, 0x55, 0x66]));
    }

    #[test]
    fn test_pack_inline_data_block_short_pads_with_zero() {
        let (aux1, aux2) = pack_inline_data_block(&[0xAA]);
        assert_eq!((aux1 >> 9) & 0x7F, 1);
        assert_eq!((aux1 >> 16) & 0xFF, 0xAA);
        assert_eq!((aux1 >> 24) & 0xFF, 0);
        assert_eq!(aux2, 0);
    }

    #[test]
    fn test_le_u32_pads_short_args() {
        assert_eq!(le_u32(&[0x01, 0x02]), 0x0201);
        assert_eq!(le_u32(&[]), 0);
    }
}
