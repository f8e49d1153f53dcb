//! Host session: reads the 17-byte custom-device command header in a loop
//! on its own unguarded `TcpStream` clone, dispatches each command, and
//! writes the matching response through the shared [`HostConn`].

use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, error, warn};

use crate::codec::{host_command, id, segment, HostHeader, NetSioMsg, HOST_HEADER_LEN};
use crate::hub::Hub;

use super::{HostConn, ReadyGate};

pub struct HostSession {
    read_stream: TcpStream,
    conn: Arc<HostConn>,
    ready: Arc<ReadyGate>,
    hub: Arc<Hub>,
    read_byte_counter: AtomicU8,
    write_byte_counter: AtomicU8,
    debug_read_byte_counter: AtomicU8,
}

impl HostSession {
    pub fn new(read_stream: TcpStream, conn: Arc<HostConn>, ready: Arc<ReadyGate>, hub: Arc<Hub>) -> Self {
        Self {
            read_stream,
            conn,
            ready,
            hub,
            read_byte_counter: AtomicU8::new(0),
            write_byte_counter: AtomicU8::new(0),
            debug_read_byte_counter: AtomicU8::new(0),
        }
    }

    /// Run the command-read loop until the emulator disconnects or an
    /// unknown command id is seen (both fatal to the session).
    pub fn run(&self) -> Result<()> {
        self.hub.host_connect();
        let mut header_buf = [0u8; HOST_HEADER_LEN];

        loop {
            match (&self.read_stream).read_exact(&mut header_buf) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(err) => return Err(err).context("reading host command header"),
            }

            let header = HostHeader::decode(header_buf);
            if !self.dispatch(header)? {
                return Ok(());
            }
        }
    }

    /// Returns `false` to terminate the session (unknown command id).
    fn dispatch(&self, header: HostHeader) -> Result<bool> {
        match header.command {
            host_command::NONE => {
                self.conn.send_response(0)?;
            }
            host_command::DEBUG_READ_BYTE => {
                let value = i32::from(self.debug_read_byte_counter.fetch_add(1, Ordering::Relaxed));
                self.conn.send_response(value)?;
            }
            host_command::READ_BYTE => {
                let value = i32::from(self.read_byte_counter.fetch_add(1, Ordering::Relaxed));
                self.conn.send_response(value)?;
            }
            host_command::WRITE_BYTE => {
                self.write_byte_counter.fetch_add(1, Ordering::Relaxed);
                self.conn.send_response(0)?;
            }
            host_command::COLD_RESET => {
                debug!("cold reset at ts={}", header.timestamp);
                // Recorded only: the original does not forward COLD_RESET to
                // peripherals (its forward call is commented out there).
                self.ready.set();
                self.conn.send_response(0)?;
            }
            host_command::WARM_RESET => {
                debug!("warm reset at ts={}", header.timestamp);
                self.hub.handle_host_msg(NetSioMsg::new(id::WARM_RESET));
                self.conn.send_response(0)?;
            }
            host_command::ERROR => {
                let len = header.param2.max(0) as usize;
                let mut message = vec![0u8; len];
                (&self.read_stream).read_exact(&mut message).context("reading error message")?;
                error!("emulator error: {}", String::from_utf8_lossy(&message));
                self.conn.send_response(0)?;
            }
            host_command::SCRIPT_EVENT => {
                let result = self.handle_script_event(header.param1 as u16, header.param2);
                self.conn.send_response(result)?;
            }
            host_command::SCRIPT_POST => {
                self.handle_script_post(header.param1 as u16, header.param2);
                self.conn.send_response(0)?;
            }
            other => {
                warn!("unknown host command id {other}, closing session");
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn handle_script_event(&self, event_id: u16, arg: i32) -> i32 {
        match event_id {
            id::DATA_BYTE_SYNC => self.hub.handle_host_msg_sync(NetSioMsg::with_byte(id::DATA_BYTE_SYNC, arg as u8)),
            id::COMMAND_OFF_SYNC => self.hub.handle_host_msg_sync(NetSioMsg::new(id::COMMAND_OFF_SYNC)),
            id::DATA_BLOCK => {
                let len = arg.max(0) as u32;
                match self.conn.read_seg_mem(segment::TX_BUFFER, 0, len) {
                    Ok(bytes) => self.hub.handle_host_msg_sync(NetSioMsg::with_arg(id::DATA_BLOCK, bytes)),
                    Err(err) => {
                        warn!("read_seg_mem for DATA_BLOCK failed: {err:#}");
                        id::ATDEV_EMPTY_SYNC
                    }
                }
            }
            id::ATDEV_DEBUG_NOP => arg,
            other => {
                debug!("unhandled synchronous script event {other:#x}, ignoring");
                id::ATDEV_EMPTY_SYNC
            }
        }
    }

    fn handle_script_post(&self, event_id: u16, arg: i32) {
        match event_id {
            id::ATDEV_READY => self.ready.set(),
            id::COLD_RESET => self.ready.set(),
            id::DATA_BYTE => self.hub.handle_host_msg(NetSioMsg::with_byte(id::DATA_BYTE, arg as u8)),
            id::SPEED_CHANGE => {
                self.hub.handle_host_msg(NetSioMsg::with_arg(id::SPEED_CHANGE, (arg as u32).to_le_bytes().to_vec()));
            }
            other => self.hub.handle_host_msg(NetSioMsg::new(other)),
        }
    }
}
