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

#[cfg(test)]
use std::collections::VecDeque;
use std::time::Duration;
use serialport::{SerialPort as SerialPortTrait, DataBits, Parity, StopBits};
use tracing::debug;

// ============================================================================
// SerialPort Trait
// ============================================================================

/// Byte-stream transport used by the sender and receiver.
///
/// There are no message boundaries; framing is done by the `slip` module.
pub trait SerialPort: Send {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()>;

    /// Read up to `buf.len()` bytes, waiting at most `timeout`.
    ///
    /// Returns an error of kind `TimedOut` when nothing arrived in time.
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize>;
}

// ============================================================================
// Real Serial Port Implementation
// ============================================================================

/// Real serial port implementation that wraps the serialport crate
pub struct RealSerialPort {
    port: Box<dyn SerialPortTrait>,
}

impl RealSerialPort {
    pub fn open(
        port_name: &str,
        baud_rate: u32,
        data_bits: DataBits,
        parity: Parity,
        stop_bits: StopBits,
    ) -> Result<Self, serialport::Error> {
        let port = serialport::new(port_name, baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(Duration::from_millis(100))
            .open()?;

        // Stale bytes from a previous session would only look like noise to
        // the frame reader, but there is no reason to keep them.
        port.clear(serialport::ClearBuffer::All)?;
        debug!(port = port_name, baud_rate, "serial port opened");

        Ok(RealSerialPort { port })
    }
}

impl SerialPort for RealSerialPort {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.port.write_all(buf)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        self.port.set_timeout(timeout)
            .map_err(std::io::Error::other)?;
        self.port.read(buf)
    }
}

// ============================================================================
// Mock Serial Port for Testing
// ============================================================================

/// Scripted link partner for FSM tests.
///
/// Inbound bytes come from a script where `None` reads as a port timeout.
/// Every `write_all` must carry exactly one SLIP frame; on drop the frames
/// written are compared with the frames expected and the script must be
/// used up.
#[cfg(test)]
pub struct MockSerialPort {
    script: VecDeque<Option<u8>>,
    scripted: usize,
    written: Vec<Vec<u8>>,
    expected: Vec<Vec<u8>>,
}

#[cfg(test)]
impl MockSerialPort {
    /// `expected_writes` is the concatenated SLIP encoding of every frame
    /// the code under test should send, in order.
    pub fn new(responses: Vec<Option<u8>>, expected_writes: Vec<u8>) -> Self {
        MockSerialPort {
            scripted: responses.len(),
            script: responses.into(),
            written: Vec::new(),
            expected: split_frames(&expected_writes),
        }
    }
}

/// Script a whole SLIP frame as mock responses.
#[cfg(test)]
pub fn framed(payload: &[u8]) -> Vec<Option<u8>> {
    crate::slip::encode(payload).into_iter().map(Some).collect()
}

#[cfg(test)]
fn split_frames(stream: &[u8]) -> Vec<Vec<u8>> {
    let mut decoder = crate::slip::SlipDecoder::default();
    stream.iter().filter_map(|&b| decoder.push(b)).collect()
}

#[cfg(test)]
fn describe(frames: &[Vec<u8>]) -> String {
    frames
        .iter()
        .enumerate()
        .map(|(i, raw)| match crate::protocol::Frame::parse(raw) {
            Ok(frame) => format!("  #{}: {:?}\n", i, frame),
            Err(e) => format!("  #{}: {:02X?} ({})\n", i, raw, e),
        })
        .collect()
}

#[cfg(test)]
impl SerialPort for MockSerialPort {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        let mut frames = split_frames(buf);
        assert!(
            frames.len() == 1 && crate::slip::encode(&frames[0]) == buf,
            "write #{} is not exactly one SLIP frame: {:02X?}",
            self.written.len(),
            buf
        );
        self.written.append(&mut frames);
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> std::io::Result<usize> {
        // An exhausted script behaves like a silent line
        let Some(Some(first)) = self.script.pop_front() else {
            return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "scripted timeout"));
        };

        buf[0] = first;
        let mut n = 1;
        while n < buf.len() {
            match self.script.front() {
                Some(&Some(byte)) => {
                    buf[n] = byte;
                    n += 1;
                    self.script.pop_front();
                }
                _ => break,
            }
        }
        Ok(n)
    }
}

#[cfg(test)]
impl Drop for MockSerialPort {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }

        assert!(
            self.script.is_empty(),
            "{} of {} scripted bytes were never read",
            self.script.len(),
            self.scripted
        );

        assert!(
            self.written == self.expected,
            "unexpected frames written\nexpected:\n{}got:\n{}",
            describe(&self.expected),
            describe(&self.written)
        );
    }
}

// ============================================================================
// Tests
// ============================================================================
