//! Outbound custom-device requests: the emulator-facing half of the host
//! channel that the session and the outbound pump share.
//!
//! All writes — the session's per-command responses, the session's
//! synchronous `read_seg_mem` request/response pair, and the pump's
//! INTERRUPT/WRITE_SEG_MEM calls — go through the same locked `TcpStream` so
//! two writers never interleave bytes mid-request. Reading the fixed command
//! header from the emulator happens on a *different*, unguarded clone owned
//! by the session (see `session.rs`) — that loop only ever runs on the
//! session's own thread, so it never needs this lock.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

use crate::codec::host_request;

pub struct HostConn {
    stream: Mutex<TcpStream>,
}

impl std::fmt::Debug for HostConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostConn").finish_non_exhaustive()
    }
}

impl HostConn {
    pub fn new(stream: TcpStream) -> Arc<Self> {
        Arc::new(Self { stream: Mutex::new(stream) })
    }

    /// Write the fixed-shape response to a command the session just handled:
    /// a `0x01` tag byte followed by a little-endian `i32`. Void acks pass 0.
    pub fn send_response(&self, value: i32) -> Result<()> {
        let mut stream = self.stream.lock().expect("host conn mutex poisoned");
        stream.write_all(&[0x01]).context("writing response tag")?;
        stream.write_all(&value.to_le_bytes()).context("writing response value")?;
        Ok(())
    }

    pub fn enable_layer(&self, layer: u8, read: bool, write: bool) -> Result<()> {
        let mut stream = self.stream.lock().expect("host conn mutex poisoned");
        stream
            .write_all(&[host_request::ENABLE_LAYER, layer, u8::from(read), u8::from(write)])
            .context("enable_layer")
    }

    pub fn set_layer_offset(&self, layer: u8, offset: u32) -> Result<()> {
        let mut stream = self.stream.lock().expect("host conn mutex poisoned");
        stream.write_all(&[host_request::SET_LAYER_OFFSET, layer]).context("set_layer_offset")?;
        stream.write_all(&offset.to_le_bytes()).context("set_layer_offset offset")
    }

    pub fn set_layer_segment_and_offset(&self, layer: u8, segment: u8, offset: u32) -> Result<()> {
        let mut stream = self.stream.lock().expect("host conn mutex poisoned");
        stream
            .write_all(&[host_request::SET_LAYER_SEGMENT_AND_OFFSET, layer, segment])
            .context("set_layer_segment_and_offset")?;
        stream.write_all(&offset.to_le_bytes()).context("set_layer_segment_and_offset offset")
    }

    pub fn set_layer_readonly(&self, layer: u8, readonly: bool) -> Result<()> {
        let mut stream = self.stream.lock().expect("host conn mutex poisoned");
        stream
            .write_all(&[host_request::SET_LAYER_READONLY, layer, u8::from(readonly)])
            .context("set_layer_readonly")
    }

    /// Request `len` bytes from `segment` at `offset`, and block for the
    /// emulator to write them back on this same locked stream.
    pub fn read_seg_mem(&self, segment: u8, offset: u32, len: u32) -> Result<Vec<u8>> {
        let mut stream = self.stream.lock().expect("host conn mutex poisoned");
        stream.write_all(&[host_request::READ_SEG_MEM, segment]).context("read_seg_mem request")?;
        stream.write_all(&offset.to_le_bytes()).context("read_seg_mem offset")?;
        stream.write_all(&len.to_le_bytes()).context("read_seg_mem len")?;
        let mut buf = vec![0u8; len as usize];
        stream.read_exact(&mut buf).context("read_seg_mem response")?;
        Ok(buf)
    }

    pub fn write_seg_mem(&self, segment: u8, offset: u32, data: &[u8]) -> Result<()> {
        let mut stream = self.stream.lock().expect("host conn mutex poisoned");
        stream.write_all(&[host_request::WRITE_SEG_MEM, segment]).context("write_seg_mem request")?;
        stream.write_all(&offset.to_le_bytes()).context("write_seg_mem offset")?;
        stream.write_all(&(data.len() as u32).to_le_bytes()).context("write_seg_mem len")?;
        stream.write_all(data).context("write_seg_mem data")
    }

    /// Field order follows the custom-device ABI's `<BBIBII>` layout:
    /// command byte, dst_segment, dst_offset, src_segment, src_offset, len.
    pub fn copy_seg_mem(&self, src_segment: u8, src_offset: u32, dst_segment: u8, dst_offset: u32, len: u32) -> Result<()> {
        let mut stream = self.stream.lock().expect("host conn mutex poisoned");
        stream.write_all(&[host_request::COPY_SEG_MEM, dst_segment]).context("copy_seg_mem request")?;
        stream.write_all(&dst_offset.to_le_bytes()).context("copy_seg_mem dst offset")?;
        stream.write_all(&[src_segment]).context("copy_seg_mem src segment")?;
        stream.write_all(&src_offset.to_le_bytes()).context("copy_seg_mem src offset")?;
        stream.write_all(&len.to_le_bytes()).context("copy_seg_mem len")
    }

    pub fn interrupt(&self, aux1: u32, aux2: u32) -> Result<()> {
        let mut stream = self.stream.lock().expect("host conn mutex poisoned");
        stream.write_all(&[host_request::INTERRUPT]).context("interrupt request")?;
        stream.write_all(&aux1.to_le_bytes()).context("interrupt aux1")?;
        stream.write_all(&aux2.to_le_bytes()).context("interrupt aux2")
    }
}
