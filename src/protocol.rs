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

//! Slipsend protocol constants and frame layouts
//!
//! Every frame payload starts with a one byte type tag. All multi-byte
//! integers are little-endian.
//!
//! ```text
//! META  01 | version u8 | file_id u32 | total u32 | chunk u16 | name_len u8 | name
//! DATA  02 | file_id u32 | sequence u32 | payload_len u16 | payload
//! ACK   10 | file_id u32 | next_sequence u32
//! ```

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

// ============================================================================
// SLIP Reserved Bytes
// ============================================================================

/// Frame delimiter, sent before and after every frame
pub const END: u8 = 0xC0;

/// Escape - the next byte is a substitute for a reserved byte
pub const ESC: u8 = 0xDB;

/// Escaped END
pub const ESC_END: u8 = 0xDC;

/// Escaped ESC
pub const ESC_ESC: u8 = 0xDD;

// ============================================================================
// Frame Types
// ============================================================================

/// Metadata - announces file size, chunk size and name
pub const TYPE_META: u8 = 0x01;

/// Data - carries one chunk of the file
pub const TYPE_DATA: u8 = 0x02;

/// Acknowledgment - receiver reports the next sequence it expects
pub const TYPE_ACK: u8 = 0x10;

// ============================================================================
// Limits
// ============================================================================

pub const PROTOCOL_VERSION: u8 = 1;

pub const MIN_CHUNK_SIZE: u16 = 64;
pub const MAX_CHUNK_SIZE: u16 = 4096;
pub const DEFAULT_CHUNK_SIZE: u16 = 1024;

pub const MAX_NAME_LEN: usize = 255;

/// Largest unescaped frame the reader will accumulate before giving up on it
pub const MAX_FRAME_LEN: usize = 8 * 1024;

pub const META_HEADER_LEN: usize = 13;
pub const DATA_HEADER_LEN: usize = 11;
pub const ACK_LEN: usize = 9;

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,

    #[error("unknown frame type 0x{0:02X}")]
    UnknownType(u8),

    #[error("truncated frame: need at least {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("frame length mismatch: header declares {declared} bytes, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },
}

// ============================================================================
// Frames
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaFrame {
    pub version: u8,
    pub file_id: u32,
    pub total_size: u32,
    pub chunk_size: u16,
    pub name: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub file_id: u32,
    pub sequence: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckFrame {
    pub file_id: u32,
    pub next_sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Meta(MetaFrame),
    Data(DataFrame),
    Ack(AckFrame),
}

impl MetaFrame {
    /// Name must already be truncated to `MAX_NAME_LEN`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let name = &self.name[..self.name.len().min(MAX_NAME_LEN)];
        let mut bytes = vec![0u8; META_HEADER_LEN];
        bytes[0] = TYPE_META;
        bytes[1] = self.version;
        LittleEndian::write_u32(&mut bytes[2..6], self.file_id);
        LittleEndian::write_u32(&mut bytes[6..10], self.total_size);
        LittleEndian::write_u16(&mut bytes[10..12], self.chunk_size);
        bytes[12] = name.len() as u8;
        bytes.extend_from_slice(name);
        bytes
    }

    fn parse(data: &[u8]) -> Result<Self, FrameError> {
        check_min_len(data, META_HEADER_LEN)?;
        let name_len = data[12] as usize;
        check_exact_len(data, META_HEADER_LEN + name_len)?;

        Ok(MetaFrame {
            version: data[1],
            file_id: LittleEndian::read_u32(&data[2..6]),
            total_size: LittleEndian::read_u32(&data[6..10]),
            chunk_size: LittleEndian::read_u16(&data[10..12]),
            name: data[META_HEADER_LEN..].to_vec(),
        })
    }

    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

impl DataFrame {
    /// Payload must not exceed `MAX_CHUNK_SIZE`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; DATA_HEADER_LEN];
        bytes[0] = TYPE_DATA;
        LittleEndian::write_u32(&mut bytes[1..5], self.file_id);
        LittleEndian::write_u32(&mut bytes[5..9], self.sequence);
        LittleEndian::write_u16(&mut bytes[9..11], self.payload.len() as u16);
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    fn parse(data: &[u8]) -> Result<Self, FrameError> {
        check_min_len(data, DATA_HEADER_LEN)?;
        let payload_len = LittleEndian::read_u16(&data[9..11]) as usize;
        check_exact_len(data, DATA_HEADER_LEN + payload_len)?;

        Ok(DataFrame {
            file_id: LittleEndian::read_u32(&data[1..5]),
            sequence: LittleEndian::read_u32(&data[5..9]),
            payload: data[DATA_HEADER_LEN..].to_vec(),
        })
    }
}

impl AckFrame {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; ACK_LEN];
        bytes[0] = TYPE_ACK;
        LittleEndian::write_u32(&mut bytes[1..5], self.file_id);
        LittleEndian::write_u32(&mut bytes[5..9], self.next_sequence);
        bytes
    }

    fn parse(data: &[u8]) -> Result<Self, FrameError> {
        check_exact_len(data, ACK_LEN)?;

        Ok(AckFrame {
            file_id: LittleEndian::read_u32(&data[1..5]),
            next_sequence: LittleEndian::read_u32(&data[5..9]),
        })
    }
}

impl Frame {
    /// Parse an unescaped frame payload as returned by the frame reader.
    pub fn parse(data: &[u8]) -> Result<Self, FrameError> {
        match data.first() {
            None => Err(FrameError::Empty),
            Some(&TYPE_META) => MetaFrame::parse(data).map(Frame::Meta),
            Some(&TYPE_DATA) => DataFrame::parse(data).map(Frame::Data),
            Some(&TYPE_ACK) => AckFrame::parse(data).map(Frame::Ack),
            Some(&other) => Err(FrameError::UnknownType(other)),
        }
    }
}

fn check_min_len(data: &[u8], needed: usize) -> Result<(), FrameError> {
    if data.len() < needed {
        return Err(FrameError::Truncated { needed, actual: data.len() });
    }
    Ok(())
}

fn check_exact_len(data: &[u8], declared: usize) -> Result<(), FrameError> {
    check_min_len(data, declared)?;
    if data.len() != declared {
        return Err(FrameError::LengthMismatch { declared, actual: data.len() });
    }
    Ok(())
}

// ============================================================================
// Session Parameters
// ============================================================================

/// Clamp a requested chunk size into `MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE`.
pub fn clamp_chunk_size(requested: usize) -> u16 {
    requested.clamp(MIN_CHUNK_SIZE as usize, MAX_CHUNK_SIZE as usize) as u16
}

/// Truncate a file name to at most `MAX_NAME_LEN` bytes without splitting a
/// UTF-8 character.
pub fn truncate_name(name: &str) -> &str {
    if name.len() <= MAX_NAME_LEN {
        return name;
    }
    let mut end = MAX_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

// ============================================================================
// Tests
// ============================================================================
