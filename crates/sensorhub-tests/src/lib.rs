//! Shared fixtures for the integration tests under `tests/`.
//!
//! [`ScriptedTransport`] stands in for a real serial/USB/TCP handle: it
//! hands back pre-recorded byte chunks from [`Transport::read_some`] and
//! records whatever a device writes, letting a test drive a device's full
//! connect handshake and data decode without opening a real port.

use std::collections::VecDeque;

use async_trait::async_trait;
use sensorhub_core::{Error, Result};

pub struct ScriptedTransport {
    reads: VecDeque<Vec<u8>>,
    pub writes: Vec<Vec<u8>>,
}

impl ScriptedTransport {
    pub fn new(reads: Vec<Vec<u8>>) -> Self {
        ScriptedTransport { reads: reads.into(), writes: Vec::new() }
    }
}

#[async_trait(?Send)]
impl sensorhub_core::Transport for ScriptedTransport {
    async fn open(&mut self, _conn_str: &str) -> Result<()> {
        Ok(())
    }

    async fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        let chunk = self.reads.pop_front().ok_or_else(|| Error::Disconnected("no more scripted data".into()))?;
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        Ok(n)
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.writes.push(buf.to_vec());
        Ok(())
    }

    fn cancel(&mut self) {}

    async fn close(&mut self) {}
}
