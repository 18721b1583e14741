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

use std::marker::PhantomData;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use crate::serial::SerialPort;
use crate::protocol::*;
use crate::slip;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug)]
pub enum ReceiverError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sender went silent while waiting for sequence {expected_sequence}")]
    Stalled { expected_sequence: u32 },

    #[error("Transfer complete")]
    TransferComplete(ReceivedFile),
}

// ============================================================================
// Configuration & Result
// ============================================================================

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Largest file accepted from a metadata frame
    pub max_file_size: u32,
    /// How long a started transfer may go without a frame
    pub idle_timeout: Duration,
    /// Silence required after the last frame before the receiver returns.
    /// Until then, retransmissions caused by a lost final ACK are answered.
    pub linger: Duration,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig {
            max_file_size: 64 * 1024 * 1024,
            idle_timeout: Duration::from_secs(30),
            linger: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub path: PathBuf,
    pub file_id: u32,
    pub bytes: usize,
    pub frames: u32,
}

// ============================================================================
// States
// ============================================================================

pub struct WaitMeta;
pub struct ReceiveData;
pub struct Linger;

enum Incoming {
    Frame(Frame),
    Malformed,
    Silence,
}

// ============================================================================
// FSM Structure
// ============================================================================

pub struct ReceiverFsm<State> {
    state: PhantomData<State>,
    serial: Box<dyn SerialPort>,
    output_dir: PathBuf,
    config: ReceiverConfig,
    current_file: Option<File>,
    current_path: PathBuf,
    file_id: u32,
    total_size: usize,
    bytes_received: usize,
    expected_sequence: u32,
}

// ============================================================================
// Trait
// ============================================================================

pub trait ReceiverState: Send {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, ReceiverError>;
}

// ============================================================================
// Helper to transition states
// ============================================================================

impl<S> ReceiverFsm<S> {
    fn transition<T>(self) -> Box<ReceiverFsm<T>> {
        Box::new(ReceiverFsm {
            state: PhantomData,
            serial: self.serial,
            output_dir: self.output_dir,
            config: self.config,
            current_file: self.current_file,
            current_path: self.current_path,
            file_id: self.file_id,
            total_size: self.total_size,
            bytes_received: self.bytes_received,
            expected_sequence: self.expected_sequence,
        })
    }

    fn io_error(&self, e: std::io::Error) -> ReceiverError {
        let type_name = std::any::type_name::<S>();
        let state_name = type_name.split("::").last().unwrap_or(type_name);
        ReceiverError::Io(std::io::Error::new(
            e.kind(),
            format!("{} (in state: {})", e, state_name)
        ))
    }

    fn read_frame(&mut self, timeout: Duration) -> Result<Incoming, ReceiverError> {
        let raw = match slip::read_frame(self.serial.as_mut(), timeout) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(Incoming::Silence),
            Err(e) => return Err(self.io_error(e)),
        };

        match Frame::parse(&raw) {
            Ok(frame) => Ok(Incoming::Frame(frame)),
            Err(e) => {
                debug!(error = %e, "discarding malformed frame");
                Ok(Incoming::Malformed)
            }
        }
    }

    fn send_ack(&mut self, next_sequence: u32) -> Result<(), ReceiverError> {
        let ack = AckFrame { file_id: self.file_id, next_sequence };
        if let Err(e) = self.serial.write_all(&slip::encode(&ack.to_bytes())) {
            return Err(self.io_error(e));
        }
        debug!(next_sequence, "sent acknowledgment");
        Ok(())
    }

    /// Validate a metadata frame and start a new session from it.
    ///
    /// Returns `false` when the frame is ignored.
    fn open_session(&mut self, meta: &MetaFrame) -> Result<bool, ReceiverError> {
        if meta.version != PROTOCOL_VERSION {
            warn!(version = meta.version, "unsupported protocol version, ignoring metadata");
            return Ok(false);
        }
        if meta.total_size > self.config.max_file_size {
            warn!(size = meta.total_size, max = self.config.max_file_size, "file too large, ignoring metadata");
            return Ok(false);
        }
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&meta.chunk_size) {
            warn!(chunk = meta.chunk_size, "chunk size out of range, ignoring metadata");
            return Ok(false);
        }

        // Closed before removal
        if self.current_file.take().is_some() {
            warn!(path = %self.current_path.display(), "removing partial file of abandoned transfer");
            if let Err(e) = std::fs::remove_file(&self.current_path) {
                return Err(self.io_error(e));
            }
        }

        let path = self.output_dir.join(sanitize_name(&meta.name, meta.file_id));
        if path.exists() {
            warn!(path = %path.display(), "overwriting existing file");
        }
        let file = match File::create(&path) {
            Ok(file) => file,
            Err(e) => return Err(self.io_error(e)),
        };

        info!(
            file_id = format_args!("{:08x}", meta.file_id),
            size = meta.total_size,
            chunk = meta.chunk_size,
            name = %meta.name_lossy(),
            "receiving into {}", path.display()
        );

        self.current_file = Some(file);
        self.current_path = path;
        self.file_id = meta.file_id;
        self.total_size = meta.total_size as usize;
        self.bytes_received = 0;
        self.expected_sequence = 0;

        self.send_ack(0)?;
        Ok(true)
    }

    /// Sync the finished file to disk and wait out late retransmissions.
    fn complete(mut self) -> Result<Box<dyn ReceiverState>, ReceiverError> {
        if let Some(file) = self.current_file.take() {
            if let Err(e) = file.sync_all() {
                return Err(self.io_error(e));
            }
        }

        info!(bytes = self.bytes_received, frames = self.expected_sequence, "transfer complete");
        let next = self.transition::<Linger>();
        Ok(next as Box<dyn ReceiverState>)
    }

    fn finish(&self) -> ReceiverError {
        ReceiverError::TransferComplete(ReceivedFile {
            path: self.current_path.clone(),
            file_id: self.file_id,
            bytes: self.bytes_received,
            frames: self.expected_sequence,
        })
    }

    fn is_complete(&self) -> bool {
        self.bytes_received == self.total_size
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl ReceiverState for ReceiverFsm<WaitMeta> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, ReceiverError> {
        let mut fsm = *self;

        let timeout = fsm.config.idle_timeout;
        match fsm.read_frame(timeout)? {
            Incoming::Frame(Frame::Meta(meta)) => {
                if !fsm.open_session(&meta)? {
                    return Ok(Box::new(fsm) as Box<dyn ReceiverState>);
                }
                if fsm.is_complete() {
                    return fsm.complete();
                }
                let next = fsm.transition::<ReceiveData>();
                Ok(next as Box<dyn ReceiverState>)
            }
            Incoming::Frame(other) => {
                debug!(frame = ?other, "no transfer in progress, ignoring frame");
                Ok(Box::new(fsm) as Box<dyn ReceiverState>)
            }
            Incoming::Malformed => Ok(Box::new(fsm) as Box<dyn ReceiverState>),
            Incoming::Silence => {
                debug!("waiting for metadata");
                Ok(Box::new(fsm) as Box<dyn ReceiverState>)
            }
        }
    }
}

impl ReceiverState for ReceiverFsm<ReceiveData> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, ReceiverError> {
        let mut fsm = *self;

        let timeout = fsm.config.idle_timeout;
        match fsm.read_frame(timeout)? {
            Incoming::Silence => {
                warn!(expected_sequence = fsm.expected_sequence, "no frame before idle timeout");
                Err(ReceiverError::Stalled { expected_sequence: fsm.expected_sequence })
            }
            Incoming::Frame(Frame::Data(data)) if data.file_id != fsm.file_id => {
                debug!(file_id = format_args!("{:08x}", data.file_id), "data for another file");
                Ok(Box::new(fsm) as Box<dyn ReceiverState>)
            }
            Incoming::Frame(Frame::Data(data)) if data.sequence < fsm.expected_sequence => {
                // Our acknowledgment was lost; repeat it without storing the data again
                debug!(sequence = data.sequence, "duplicate data frame");
                fsm.send_ack(data.sequence + 1)?;
                Ok(Box::new(fsm) as Box<dyn ReceiverState>)
            }
            Incoming::Frame(Frame::Data(data)) if data.sequence > fsm.expected_sequence => {
                debug!(sequence = data.sequence, expected = fsm.expected_sequence, "data frame out of order");
                Ok(Box::new(fsm) as Box<dyn ReceiverState>)
            }
            Incoming::Frame(Frame::Data(data)) => {
                if fsm.bytes_received + data.payload.len() > fsm.total_size {
                    warn!(sequence = data.sequence, len = data.payload.len(), "data frame overruns announced size");
                    return Ok(Box::new(fsm) as Box<dyn ReceiverState>);
                }

                if let Some(ref mut file) = fsm.current_file {
                    if let Err(e) = file.write_all(&data.payload) {
                        return Err(fsm.io_error(e));
                    }
                }
                fsm.bytes_received += data.payload.len();
                fsm.expected_sequence += 1;
                debug!(sequence = data.sequence, received = fsm.bytes_received, total = fsm.total_size, "stored data frame");

                let next_sequence = fsm.expected_sequence;
                fsm.send_ack(next_sequence)?;

                if fsm.is_complete() {
                    return fsm.complete();
                }
                Ok(Box::new(fsm) as Box<dyn ReceiverState>)
            }
            Incoming::Frame(Frame::Meta(meta)) if meta.file_id == fsm.file_id => {
                if fsm.expected_sequence == 0 {
                    debug!("metadata repeated, acknowledging again");
                    fsm.send_ack(0)?;
                }
                Ok(Box::new(fsm) as Box<dyn ReceiverState>)
            }
            Incoming::Frame(Frame::Meta(meta)) => {
                info!(file_id = format_args!("{:08x}", meta.file_id), "new transfer announced, restarting");
                if fsm.open_session(&meta)? && fsm.is_complete() {
                    return fsm.complete();
                }
                Ok(Box::new(fsm) as Box<dyn ReceiverState>)
            }
            Incoming::Frame(Frame::Ack(_)) => {
                debug!("ignoring acknowledgment frame");
                Ok(Box::new(fsm) as Box<dyn ReceiverState>)
            }
            Incoming::Malformed => Ok(Box::new(fsm) as Box<dyn ReceiverState>),
        }
    }
}

impl ReceiverState for ReceiverFsm<Linger> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, ReceiverError> {
        let mut fsm = *self;

        let timeout = fsm.config.linger;
        match fsm.read_frame(timeout)? {
            Incoming::Silence => Err(fsm.finish()),
            Incoming::Frame(Frame::Data(data))
                if data.file_id == fsm.file_id && data.sequence < fsm.expected_sequence =>
            {
                debug!(sequence = data.sequence, "retransmission after completion");
                fsm.send_ack(data.sequence + 1)?;
                Ok(Box::new(fsm) as Box<dyn ReceiverState>)
            }
            Incoming::Frame(Frame::Meta(meta))
                if meta.file_id == fsm.file_id && fsm.expected_sequence == 0 =>
            {
                debug!("metadata repeated after completion");
                fsm.send_ack(0)?;
                Ok(Box::new(fsm) as Box<dyn ReceiverState>)
            }
            Incoming::Frame(other) => {
                debug!(frame = ?other, "transfer finished, ignoring frame");
                Ok(Box::new(fsm) as Box<dyn ReceiverState>)
            }
            Incoming::Malformed => Ok(Box::new(fsm) as Box<dyn ReceiverState>),
        }
    }
}

// ============================================================================
// Constructor & Runner
// ============================================================================

impl ReceiverFsm<WaitMeta> {
    pub fn new(serial: Box<dyn SerialPort>, output_dir: PathBuf, config: ReceiverConfig) -> Box<dyn ReceiverState> {
        Box::new(ReceiverFsm {
            state: PhantomData::<WaitMeta>,
            serial,
            output_dir,
            config,
            current_file: None,
            current_path: PathBuf::new(),
            file_id: 0,
            total_size: 0,
            bytes_received: 0,
            expected_sequence: 0,
        })
    }
}

/// Drive a receiver FSM until one file has been received.
pub fn run(mut fsm: Box<dyn ReceiverState>) -> Result<ReceivedFile, ReceiverError> {
    loop {
        match fsm.step() {
            Ok(next) => fsm = next,
            Err(ReceiverError::TransferComplete(received)) => return Ok(received),
            Err(e) => return Err(e),
        }
    }
}

pub fn receive_file(
    serial: Box<dyn SerialPort>,
    output_dir: PathBuf,
    config: ReceiverConfig,
) -> Result<ReceivedFile, ReceiverError> {
    run(ReceiverFsm::new(serial, output_dir, config))
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Reduce an announced file name to a safe final path component.
fn sanitize_name(name: &[u8], file_id: u32) -> String {
    let name = String::from_utf8_lossy(name);
    let base = name
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or("")
        .chars()
        .map(|c| if c.is_control() { '_' } else { c })
        .collect::<String>();
    let base = base.trim();

    if base.is_empty() || base == "." || base == ".." {
        format!("received_{:08x}.bin", file_id)
    } else {
        base.to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::{framed, MockSerialPort};

    const FILE_ID: u32 = 0x0BADF00D;

    fn config() -> ReceiverConfig {
        ReceiverConfig {
            max_file_size: 1024 * 1024,
            idle_timeout: Duration::from_millis(50),
            linger: Duration::from_millis(50),
        }
    }

    fn meta_with(version: u8, file_id: u32, total: u32, chunk_size: u16, name: &[u8]) -> Vec<Option<u8>> {
        framed(&MetaFrame {
            version,
            file_id,
            total_size: total,
            chunk_size,
            name: name.to_vec(),
        }.to_bytes())
    }

    fn meta(file_id: u32, total: u32, name: &[u8]) -> Vec<Option<u8>> {
        meta_with(PROTOCOL_VERSION, file_id, total, 64, name)
    }

    fn data(file_id: u32, sequence: u32, payload: &[u8]) -> Vec<Option<u8>> {
        framed(&DataFrame { file_id, sequence, payload: payload.to_vec() }.to_bytes())
    }

    fn ack(file_id: u32, next_sequence: u32) -> Vec<u8> {
        slip::encode(&AckFrame { file_id, next_sequence }.to_bytes())
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name(b"photo.jpg", 1), "photo.jpg");
        assert_eq!(sanitize_name(b"/etc/passwd", 1), "passwd");
        assert_eq!(sanitize_name(b"..\\..\\boot.ini", 1), "boot.ini");
        assert_eq!(sanitize_name(b"a\nb", 1), "a_b");
        assert_eq!(sanitize_name(b"", 0xAB), "received_000000ab.bin");
        assert_eq!(sanitize_name(b"dir/..", 0xAB), "received_000000ab.bin");
        assert_eq!(sanitize_name(b"dir/", 0xAB), "received_000000ab.bin");
    }

    #[test]
    fn test_receiver_full_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let payload = content(100);

        let mut responses = meta(FILE_ID, 100, b"full.bin");
        responses.extend(data(FILE_ID, 0, &payload[..64]));
        responses.extend(data(FILE_ID, 1, &payload[64..]));

        let mut expected_writes = ack(FILE_ID, 0);
        expected_writes.extend(ack(FILE_ID, 1));
        expected_writes.extend(ack(FILE_ID, 2));

        let mock_serial = Box::new(MockSerialPort::new(responses, expected_writes));
        let received = receive_file(mock_serial, dir.path().to_path_buf(), config())
            .expect("transfer should complete");

        assert_eq!(received.path, dir.path().join("full.bin"));
        assert_eq!(received.bytes, 100);
        assert_eq!(received.frames, 2);
        assert_eq!(std::fs::read(&received.path).unwrap(), payload);
    }

    #[test]
    fn test_receiver_empty_file() {
        let dir = tempfile::tempdir().unwrap();

        let responses = meta(FILE_ID, 0, b"empty.bin");
        let expected_writes = ack(FILE_ID, 0);

        let mock_serial = Box::new(MockSerialPort::new(responses, expected_writes));
        let received = receive_file(mock_serial, dir.path().to_path_buf(), config())
            .expect("transfer should complete");

        assert_eq!(received.frames, 0);
        assert_eq!(std::fs::read(&received.path).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_receiver_duplicate_data_reacknowledged() {
        let dir = tempfile::tempdir().unwrap();
        let payload = content(100);

        let mut responses = meta(FILE_ID, 100, b"dup.bin");
        responses.extend(meta(FILE_ID, 100, b"dup.bin"));
        responses.extend(data(FILE_ID, 0, &payload[..64]));
        responses.extend(data(FILE_ID, 0, &payload[..64]));
        responses.extend(data(FILE_ID, 1, &payload[64..]));

        let mut expected_writes = ack(FILE_ID, 0);
        expected_writes.extend(ack(FILE_ID, 0));
        expected_writes.extend(ack(FILE_ID, 1));
        expected_writes.extend(ack(FILE_ID, 1));
        expected_writes.extend(ack(FILE_ID, 2));

        let mock_serial = Box::new(MockSerialPort::new(responses, expected_writes));
        let received = receive_file(mock_serial, dir.path().to_path_buf(), config())
            .expect("transfer should complete");

        assert_eq!(std::fs::read(&received.path).unwrap(), payload);
    }

    #[test]
    fn test_receiver_ignores_foreign_and_out_of_order() {
        let dir = tempfile::tempdir().unwrap();
        let payload = content(70);

        let mut responses = data(FILE_ID, 0, &payload[..64]);  // before any metadata
        responses.extend(meta(FILE_ID, 70, b"order.bin"));
        responses.extend(data(0x12345678, 0, &[0xEE; 64]));     // other session
        responses.extend(data(FILE_ID, 1, &payload[64..]));     // too early
        responses.extend(framed(&[0x55, 0x01, 0x02]));          // unknown type
        responses.extend(data(FILE_ID, 0, &payload[..64]));
        responses.extend(data(FILE_ID, 1, &payload[64..]));

        let mut expected_writes = ack(FILE_ID, 0);
        expected_writes.extend(ack(FILE_ID, 1));
        expected_writes.extend(ack(FILE_ID, 2));

        let mock_serial = Box::new(MockSerialPort::new(responses, expected_writes));
        let received = receive_file(mock_serial, dir.path().to_path_buf(), config())
            .expect("transfer should complete");

        assert_eq!(std::fs::read(&received.path).unwrap(), payload);
    }

    #[test]
    fn test_receiver_rejects_oversize_and_overrun() {
        let dir = tempfile::tempdir().unwrap();
        let payload = content(10);

        let mut responses = meta(FILE_ID, 2 * 1024 * 1024, b"huge.bin");
        responses.extend(meta(FILE_ID, 10, b"small.bin"));
        responses.extend(data(FILE_ID, 0, &content(64)));   // larger than announced
        responses.extend(data(FILE_ID, 0, &payload));

        let mut expected_writes = ack(FILE_ID, 0);
        expected_writes.extend(ack(FILE_ID, 1));

        let mock_serial = Box::new(MockSerialPort::new(responses, expected_writes));
        let received = receive_file(mock_serial, dir.path().to_path_buf(), config())
            .expect("transfer should complete");

        assert!(!dir.path().join("huge.bin").exists());
        assert_eq!(received.path, dir.path().join("small.bin"));
        assert_eq!(std::fs::read(&received.path).unwrap(), payload);
    }

    #[test]
    fn test_receiver_ignores_unsupported_metadata() {
        let dir = tempfile::tempdir().unwrap();

        let mut responses = meta_with(2, FILE_ID, 10, 64, b"version.bin");
        responses.extend(meta_with(PROTOCOL_VERSION, FILE_ID, 10, 32, b"tiny_chunk.bin"));
        responses.extend(meta_with(PROTOCOL_VERSION, FILE_ID, 10, 8192, b"big_chunk.bin"));
        responses.extend(meta(FILE_ID, 0, b"accepted.bin"));

        // Only the last metadata frame is acknowledged
        let expected_writes = ack(FILE_ID, 0);

        let mock_serial = Box::new(MockSerialPort::new(responses, expected_writes));
        let received = receive_file(mock_serial, dir.path().to_path_buf(), config())
            .expect("transfer should complete");

        assert_eq!(received.path, dir.path().join("accepted.bin"));
        for rejected in ["version.bin", "tiny_chunk.bin", "big_chunk.bin"] {
            assert!(!dir.path().join(rejected).exists(), "{} should not be created", rejected);
        }
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_receiver_accepts_chunk_size_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let payload = content(100);

        let mut responses = meta_with(PROTOCOL_VERSION, FILE_ID, 100, MIN_CHUNK_SIZE, b"low.bin");
        responses.extend(meta_with(PROTOCOL_VERSION, FILE_ID + 1, 100, MAX_CHUNK_SIZE, b"high.bin"));
        responses.extend(data(FILE_ID + 1, 0, &payload));

        let mut expected_writes = ack(FILE_ID, 0);
        expected_writes.extend(ack(FILE_ID + 1, 0));
        expected_writes.extend(ack(FILE_ID + 1, 1));

        let mock_serial = Box::new(MockSerialPort::new(responses, expected_writes));
        let received = receive_file(mock_serial, dir.path().to_path_buf(), config())
            .expect("transfer should complete");

        assert_eq!(received.path, dir.path().join("high.bin"));
        assert_eq!(std::fs::read(&received.path).unwrap(), payload);
    }

    #[test]
    fn test_receiver_reacknowledges_after_completion() {
        let dir = tempfile::tempdir().unwrap();
        let payload = content(100);

        let mut responses = meta(FILE_ID, 100, b"late.bin");
        responses.extend(data(FILE_ID, 0, &payload[..64]));
        responses.extend(data(FILE_ID, 1, &payload[64..]));
        // Final ACK lost on the way back: the sender repeats the last frame
        responses.extend(data(FILE_ID, 1, &payload[64..]));
        responses.extend(data(0x12345678, 0, &[0xEE; 16]));
        responses.extend(data(FILE_ID, 1, &payload[64..]));

        let mut expected_writes = ack(FILE_ID, 0);
        expected_writes.extend(ack(FILE_ID, 1));
        expected_writes.extend(ack(FILE_ID, 2));
        expected_writes.extend(ack(FILE_ID, 2));
        expected_writes.extend(ack(FILE_ID, 2));

        let mock_serial = Box::new(MockSerialPort::new(responses, expected_writes));
        let received = receive_file(mock_serial, dir.path().to_path_buf(), config())
            .expect("transfer should complete");

        assert_eq!(received.frames, 2);
        assert_eq!(std::fs::read(&received.path).unwrap(), payload);
    }

    #[test]
    fn test_receiver_reacknowledges_empty_file_metadata() {
        let dir = tempfile::tempdir().unwrap();

        let mut responses = meta(FILE_ID, 0, b"empty.bin");
        responses.extend(meta(FILE_ID, 0, b"empty.bin"));

        let mut expected_writes = ack(FILE_ID, 0);
        expected_writes.extend(ack(FILE_ID, 0));

        let mock_serial = Box::new(MockSerialPort::new(responses, expected_writes));
        let received = receive_file(mock_serial, dir.path().to_path_buf(), config())
            .expect("transfer should complete");

        assert_eq!(received.bytes, 0);
    }

    #[test]
    fn test_receiver_overwrites_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("exists.bin");
        std::fs::write(&target, vec![0xAA; 500]).unwrap();
        let payload = content(30);

        let mut responses = meta(FILE_ID, 30, b"exists.bin");
        responses.extend(data(FILE_ID, 0, &payload));

        let mut expected_writes = ack(FILE_ID, 0);
        expected_writes.extend(ack(FILE_ID, 1));

        let mock_serial = Box::new(MockSerialPort::new(responses, expected_writes));
        let received = receive_file(mock_serial, dir.path().to_path_buf(), config())
            .expect("transfer should complete");

        assert_eq!(received.path, target);
        assert_eq!(std::fs::read(&target).unwrap(), payload);
    }

    #[test]
    fn test_receiver_restarts_on_new_file_id() {
        let dir = tempfile::tempdir().unwrap();
        let payload = content(20);

        let mut responses = meta(FILE_ID, 100, b"first.bin");
        responses.extend(data(FILE_ID, 0, &content(64)));
        responses.extend(meta(FILE_ID + 1, 20, b"second.bin"));
        responses.extend(data(FILE_ID + 1, 0, &payload));

        let mut expected_writes = ack(FILE_ID, 0);
        expected_writes.extend(ack(FILE_ID, 1));
        expected_writes.extend(ack(FILE_ID + 1, 0));
        expected_writes.extend(ack(FILE_ID + 1, 1));

        let mock_serial = Box::new(MockSerialPort::new(responses, expected_writes));
        let received = receive_file(mock_serial, dir.path().to_path_buf(), config())
            .expect("transfer should complete");

        assert_eq!(received.file_id, FILE_ID + 1);
        assert_eq!(std::fs::read(&received.path).unwrap(), payload);
        assert!(!dir.path().join("first.bin").exists(), "abandoned partial file should be removed");
    }

    #[test]
    fn test_receiver_stalls() {
        let dir = tempfile::tempdir().unwrap();

        let responses = meta(FILE_ID, 100, b"stall.bin");
        let expected_writes = ack(FILE_ID, 0);

        let mock_serial = Box::new(MockSerialPort::new(responses, expected_writes));
        match receive_file(mock_serial, dir.path().to_path_buf(), config()) {
            Err(ReceiverError::Stalled { expected_sequence }) => assert_eq!(expected_sequence, 0),
            other => panic!("Expected stall, got {:?}", other),
        }
    }

    struct Pipe {
        tx: std::sync::mpsc::Sender<u8>,
        rx: std::sync::mpsc::Receiver<u8>,
        drop_writes: Vec<usize>,
        writes: usize,
    }

    impl SerialPort for Pipe {
        fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
            let n = self.writes;
            self.writes += 1;
            if self.drop_writes.contains(&n) {
                return Ok(());
            }
            for &b in buf {
                let _ = self.tx.send(b);
            }
            Ok(())
        }

        fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
            match self.rx.recv_timeout(timeout) {
                Ok(b) => {
                    buf[0] = b;
                    Ok(1)
                }
                Err(_) => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "pipe timeout")),
            }
        }
    }

    fn pipe_pair(drop_a: Vec<usize>, drop_b: Vec<usize>) -> (Pipe, Pipe) {
        let (a_tx, b_rx) = std::sync::mpsc::channel();
        let (b_tx, a_rx) = std::sync::mpsc::channel();
        (
            Pipe { tx: a_tx, rx: a_rx, drop_writes: drop_a, writes: 0 },
            Pipe { tx: b_tx, rx: b_rx, drop_writes: drop_b, writes: 0 },
        )
    }

    #[test]
    fn test_loopback_with_lost_frames() {
        use crate::sender::{send_file, TransferConfig};

        let dir = tempfile::tempdir().unwrap();
        let payload = content(300);

        // Sender loses its second data write; receiver loses the first data ACK
        let (sender_end, receiver_end) = pipe_pair(vec![2], vec![1]);

        let to_send = payload.clone();
        let sender = std::thread::spawn(move || {
            let config = TransferConfig {
                chunk_size: 64,
                retries: 3,
                ack_timeout: Duration::from_millis(100),
                frame_delay: Duration::ZERO,
            };
            send_file(Box::new(sender_end), to_send, "loop.bin", config, Box::new(|_: usize, _: usize, _: u32| {}))
        });

        let config = ReceiverConfig {
            max_file_size: 1024,
            idle_timeout: Duration::from_secs(2),
            linger: Duration::from_millis(500),
        };
        let received = receive_file(Box::new(receiver_end), dir.path().to_path_buf(), config)
            .expect("receiver should complete");
        let report = sender.join().unwrap().expect("sender should complete");

        assert_eq!(report.frames, 5);
        assert_eq!(report.retransmissions, 2);
        assert_eq!(report.file_id, received.file_id);
        assert_eq!(received.frames, 5);
        assert_eq!(std::fs::read(&received.path).unwrap(), payload);
    }

    #[test]
    fn test_loopback_with_lost_final_ack() {
        use crate::sender::{send_file, TransferConfig};

        let dir = tempfile::tempdir().unwrap();
        let payload = content(100);

        // Receiver writes: ACK 0, ACK 1, then the final ACK 2 is lost
        let (sender_end, receiver_end) = pipe_pair(vec![], vec![2]);

        let to_send = payload.clone();
        let sender = std::thread::spawn(move || {
            let config = TransferConfig {
                chunk_size: 64,
                retries: 2,
                ack_timeout: Duration::from_millis(100),
                frame_delay: Duration::ZERO,
            };
            send_file(Box::new(sender_end), to_send, "last.bin", config, Box::new(|_: usize, _: usize, _: u32| {}))
        });

        let config = ReceiverConfig {
            max_file_size: 1024,
            idle_timeout: Duration::from_secs(2),
            linger: Duration::from_millis(500),
        };
        let received = receive_file(Box::new(receiver_end), dir.path().to_path_buf(), config)
            .expect("receiver should complete");
        let report = sender.join().unwrap().expect("sender should complete");

        assert_eq!(report.frames, 2);
        assert_eq!(report.retransmissions, 1);
        assert_eq!(received.bytes, 100);
        assert_eq!(std::fs::read(&received.path).unwrap(), payload);
    }
}
