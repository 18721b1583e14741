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
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use crate::serial::SerialPort;
use crate::protocol::*;
use crate::slip;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug)]
pub enum SenderError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File too large: {0} bytes (limit is {max} bytes)", max = u32::MAX)]
    FileTooLarge(usize),

    #[error("Metadata not acknowledged after {attempts} attempts")]
    MetadataNotAcknowledged { attempts: u32 },

    #[error("Transfer failed at sequence {sequence} after {attempts} attempts")]
    RetriesExhausted { sequence: u32, attempts: u32 },

    #[error("Transfer complete")]
    TransferComplete(TransferReport),
}

// ============================================================================
// Configuration & Reporting
// ============================================================================

#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Requested chunk size, clamped to `MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE`
    pub chunk_size: usize,
    /// Retransmissions allowed per frame after the first attempt
    pub retries: u32,
    /// How long to wait for each acknowledgment
    pub ack_timeout: Duration,
    /// Pause after every acknowledged data frame
    pub frame_delay: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            chunk_size: DEFAULT_CHUNK_SIZE as usize,
            retries: 5,
            ack_timeout: Duration::from_secs(1),
            frame_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub file_id: u32,
    pub total_bytes: usize,
    pub frames: u32,
    pub retransmissions: u32,
    pub elapsed: Duration,
}

/// Receives `(bytes_acked, total_bytes, frames_acked)` after every
/// acknowledged data frame.
pub trait ProgressReporter: Send {
    fn report(&mut self, sent: usize, total: usize, frames: u32);
}

impl<F> ProgressReporter for F
where
    F: FnMut(usize, usize, u32) + Send,
{
    fn report(&mut self, sent: usize, total: usize, frames: u32) {
        self(sent, total, frames)
    }
}

// ============================================================================
// States
// ============================================================================

pub struct SendMeta;
pub struct AwaitMetaAck;
pub struct SendData;
pub struct AwaitDataAck;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct SenderFsm<State> {
    state: PhantomData<State>,
    serial: Box<dyn SerialPort>,
    progress: Box<dyn ProgressReporter>,
    config: TransferConfig,
    file_id: u32,
    data: Vec<u8>,
    name: String,
    chunk_size: u16,
    sequence: u32,
    offset: usize,
    // Encoded frame awaiting acknowledgment, resent verbatim on retry
    frame: Vec<u8>,
    frame_len: usize,
    attempts: u32,
    retransmissions: u32,
    started: Instant,
}

// ============================================================================
// Trait
// ============================================================================

pub trait SenderState: Send {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError>;
}

// ============================================================================
// Helper to transition states
// ============================================================================

impl<S> SenderFsm<S> {
    fn transition<T>(self) -> Box<SenderFsm<T>> {
        Box::new(SenderFsm {
            state: PhantomData,
            serial: self.serial,
            progress: self.progress,
            config: self.config,
            file_id: self.file_id,
            data: self.data,
            name: self.name,
            chunk_size: self.chunk_size,
            sequence: self.sequence,
            offset: self.offset,
            frame: self.frame,
            frame_len: self.frame_len,
            attempts: self.attempts,
            retransmissions: self.retransmissions,
            started: self.started,
        })
    }

    fn io_error(&self, e: std::io::Error) -> SenderError {
        let type_name = std::any::type_name::<S>();
        let state_name = type_name.split("::").last().unwrap_or(type_name);
        SenderError::Io(std::io::Error::new(
            e.kind(),
            format!("{} (in state: {})", e, state_name)
        ))
    }

    fn send_frame(&mut self) -> Result<(), SenderError> {
        if let Err(e) = self.serial.write_all(&self.frame) {
            return Err(self.io_error(e));
        }
        self.attempts += 1;
        Ok(())
    }

    fn retransmit(&mut self) -> Result<(), SenderError> {
        self.retransmissions += 1;
        self.send_frame()
    }

    fn budget_left(&self) -> bool {
        self.attempts <= self.config.retries
    }

    /// Wait for an ACK carrying this session's file id and `expected_next`.
    ///
    /// Anything else, including silence, is a failed attempt.
    fn wait_for_ack(&mut self, expected_next: u32) -> Result<bool, SenderError> {
        let frame = match slip::read_frame(self.serial.as_mut(), self.config.ack_timeout) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!(attempt = self.attempts, "no acknowledgment before timeout");
                return Ok(false);
            }
            Err(e) => return Err(self.io_error(e)),
        };

        match Frame::parse(&frame) {
            Ok(Frame::Ack(ack)) if ack.file_id != self.file_id => {
                debug!(file_id = format_args!("{:08x}", ack.file_id), "acknowledgment for another file");
                Ok(false)
            }
            Ok(Frame::Ack(ack)) if ack.next_sequence != expected_next => {
                debug!(got = ack.next_sequence, expected = expected_next, "acknowledgment out of sequence");
                Ok(false)
            }
            Ok(Frame::Ack(_)) => {
                debug!(next_sequence = expected_next, "received acknowledgment");
                Ok(true)
            }
            Ok(other) => {
                debug!(frame = ?other, "expected acknowledgment");
                Ok(false)
            }
            Err(e) => {
                debug!(error = %e, "malformed frame");
                Ok(false)
            }
        }
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl SenderState for SenderFsm<SendMeta> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError> {
        let mut fsm = *self;

        let total_size = u32::try_from(fsm.data.len())
            .map_err(|_| SenderError::FileTooLarge(fsm.data.len()))?;

        let meta = MetaFrame {
            version: PROTOCOL_VERSION,
            file_id: fsm.file_id,
            total_size,
            chunk_size: fsm.chunk_size,
            name: fsm.name.as_bytes().to_vec(),
        };
        fsm.frame = slip::encode(&meta.to_bytes());
        fsm.attempts = 0;
        fsm.send_frame()?;

        info!(
            file_id = format_args!("{:08x}", fsm.file_id),
            size = total_size,
            chunk = fsm.chunk_size,
            name = %fsm.name,
            "sent metadata"
        );

        let next = fsm.transition::<AwaitMetaAck>();
        Ok(next as Box<dyn SenderState>)
    }
}

impl SenderState for SenderFsm<AwaitMetaAck> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError> {
        let mut fsm = *self;

        if fsm.wait_for_ack(0)? {
            let next = fsm.transition::<SendData>();
            return Ok(next as Box<dyn SenderState>);
        }

        if !fsm.budget_left() {
            warn!(attempts = fsm.attempts, "metadata not acknowledged, giving up");
            return Err(SenderError::MetadataNotAcknowledged { attempts: fsm.attempts });
        }

        warn!(attempt = fsm.attempts + 1, "retransmitting metadata");
        fsm.retransmit()?;
        Ok(Box::new(fsm) as Box<dyn SenderState>)
    }
}

impl SenderState for SenderFsm<SendData> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError> {
        let mut fsm = *self;

        if fsm.offset >= fsm.data.len() {
            let report = TransferReport {
                file_id: fsm.file_id,
                total_bytes: fsm.data.len(),
                frames: fsm.sequence,
                retransmissions: fsm.retransmissions,
                elapsed: fsm.started.elapsed(),
            };
            info!(bytes = report.total_bytes, frames = report.frames, "transfer complete");
            return Err(SenderError::TransferComplete(report));
        }

        let end = (fsm.offset + fsm.chunk_size as usize).min(fsm.data.len());
        let chunk = DataFrame {
            file_id: fsm.file_id,
            sequence: fsm.sequence,
            payload: fsm.data[fsm.offset..end].to_vec(),
        };
        fsm.frame_len = chunk.payload.len();
        fsm.frame = slip::encode(&chunk.to_bytes());
        fsm.attempts = 0;
        fsm.send_frame()?;

        debug!(sequence = fsm.sequence, len = fsm.frame_len, "sent data frame");

        let next = fsm.transition::<AwaitDataAck>();
        Ok(next as Box<dyn SenderState>)
    }
}

impl SenderState for SenderFsm<AwaitDataAck> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError> {
        let mut fsm = *self;

        if fsm.wait_for_ack(fsm.sequence + 1)? {
            fsm.offset += fsm.frame_len;
            fsm.sequence += 1;
            fsm.progress.report(fsm.offset, fsm.data.len(), fsm.sequence);

            if !fsm.config.frame_delay.is_zero() {
                std::thread::sleep(fsm.config.frame_delay);
            }

            let next = fsm.transition::<SendData>();
            return Ok(next as Box<dyn SenderState>);
        }

        if !fsm.budget_left() {
            warn!(sequence = fsm.sequence, attempts = fsm.attempts, "retry budget exhausted");
            return Err(SenderError::RetriesExhausted {
                sequence: fsm.sequence,
                attempts: fsm.attempts,
            });
        }

        warn!(sequence = fsm.sequence, attempt = fsm.attempts + 1, "retransmitting data frame");
        fsm.retransmit()?;
        Ok(Box::new(fsm) as Box<dyn SenderState>)
    }
}

// ============================================================================
// Constructor & Runner
// ============================================================================

impl SenderFsm<SendMeta> {
    pub fn new(
        serial: Box<dyn SerialPort>,
        data: Vec<u8>,
        file_name: &str,
        config: TransferConfig,
        progress: Box<dyn ProgressReporter>,
    ) -> Box<dyn SenderState> {
        Self::with_file_id(serial, data, file_name, config, progress, rand::random())
    }

    pub fn with_file_id(
        serial: Box<dyn SerialPort>,
        data: Vec<u8>,
        file_name: &str,
        config: TransferConfig,
        progress: Box<dyn ProgressReporter>,
        file_id: u32,
    ) -> Box<dyn SenderState> {
        Box::new(SenderFsm {
            state: PhantomData::<SendMeta>,
            serial,
            progress,
            chunk_size: clamp_chunk_size(config.chunk_size),
            config,
            file_id,
            data,
            name: truncate_name(file_name).to_string(),
            sequence: 0,
            offset: 0,
            frame: Vec::new(),
            frame_len: 0,
            attempts: 0,
            retransmissions: 0,
            started: Instant::now(),
        })
    }
}

/// Drive a sender FSM until it completes or fails.
pub fn run(mut fsm: Box<dyn SenderState>) -> Result<TransferReport, SenderError> {
    loop {
        match fsm.step() {
            Ok(next) => fsm = next,
            Err(SenderError::TransferComplete(report)) => return Ok(report),
            Err(e) => return Err(e),
        }
    }
}

/// Send `data` as `file_name` over `serial` with a fresh random file id.
pub fn send_file(
    serial: Box<dyn SerialPort>,
    data: Vec<u8>,
    file_name: &str,
    config: TransferConfig,
    progress: Box<dyn ProgressReporter>,
) -> Result<TransferReport, SenderError> {
    run(SenderFsm::new(serial, data, file_name, config, progress))
}

// ============================================================================
// Tests
// ============================================================================
