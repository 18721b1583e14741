// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! SLIP framing
//!
//! Frames are wrapped in `END` on both sides. Inside a frame `END` becomes
//! `ESC ESC_END` and `ESC` becomes `ESC ESC_ESC`.

use std::time::{Duration, Instant};
use tracing::debug;
use crate::protocol::{END, ESC, ESC_END, ESC_ESC, MAX_FRAME_LEN};
use crate::serial::SerialPort;

// ============================================================================
// Encoder
// ============================================================================

pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 2);
    out.push(END);
    for &b in payload {
        match b {
            END => out.extend_from_slice(&[ESC, ESC_END]),
            ESC => out.extend_from_slice(&[ESC, ESC_ESC]),
            _ => out.push(b),
        }
    }
    out.push(END);
    out
}

// ============================================================================
// Decoder
// ============================================================================

/// Incremental SLIP decoder, fed one byte at a time.
#[derive(Debug)]
pub struct SlipDecoder {
    buf: Vec<u8>,
    in_frame: bool,
    escape_pending: bool,
    max_len: usize,
}

impl Default for SlipDecoder {
    fn default() -> Self {
        Self::new(MAX_FRAME_LEN)
    }
}

impl SlipDecoder {
    pub fn new(max_len: usize) -> Self {
        SlipDecoder {
            buf: Vec::new(),
            in_frame: false,
            escape_pending: false,
            max_len,
        }
    }

    /// Feed one byte; returns the unescaped frame when `byte` closes one.
    pub fn push(&mut self, byte: u8) -> Option<Vec<u8>> {
        if byte == END {
            if self.in_frame && !self.escape_pending && !self.buf.is_empty() {
                self.in_frame = false;
                return Some(std::mem::take(&mut self.buf));
            }
            // Leading or repeated delimiter, or an escape cut short: start over
            self.buf.clear();
            self.in_frame = true;
            self.escape_pending = false;
            return None;
        }

        if !self.in_frame {
            return None;
        }

        if self.escape_pending {
            self.escape_pending = false;
            let decoded = match byte {
                ESC_END => END,
                ESC_ESC => ESC,
                other => other,
            };
            self.append(decoded);
        } else if byte == ESC {
            self.escape_pending = true;
        } else {
            self.append(byte);
        }

        None
    }

    fn append(&mut self, byte: u8) {
        if self.buf.len() >= self.max_len {
            debug!(max_len = self.max_len, "frame too long, discarding");
            self.buf.clear();
            self.in_frame = false;
            return;
        }
        self.buf.push(byte);
    }
}

// ============================================================================
// Frame Reader
// ============================================================================

/// Read one complete frame from `serial` within `timeout`.
///
/// Returns `Ok(None)` when the deadline passes first. The remaining budget is
/// handed to the port on every read, so a port timeout ends the wait.
pub fn read_frame(serial: &mut dyn SerialPort, timeout: Duration) -> std::io::Result<Option<Vec<u8>>> {
    let deadline = Instant::now() + timeout;
    let mut decoder = SlipDecoder::default();
    let mut buf = [0u8; 1];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }

        match serial.read_timeout(&mut buf, remaining) {
            Ok(0) => continue,
            Ok(_) => {
                if let Some(frame) = decoder.push(buf[0]) {
                    return Ok(Some(frame));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
