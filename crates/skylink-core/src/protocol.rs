//! Wire protocol definitions
//!
//! Every frame is a fixed 12-byte little-endian header followed by `size`
//! payload bytes:
//!
//! ```text
//! [0..2]  seq_number      u16
//! [2]     session         u8
//! [3]     opcode          u8
//! [4]     size            u8
//! [5]     req_opcode      u8
//! [6]     burst_complete  u8
//! [7]     padding         u8
//! [8..12] offset          u32
//! [12..]  data            size bytes (max 239)
//! ```
//!
//! Replies echo the request opcode in `req_opcode` and carry the request's
//! sequence number plus one.

use bytes::{Buf, BufMut};

use crate::error::{DecodeError, NakCode};
use crate::{HEADER_LEN, MAX_DATA_LEN, MAX_FRAME_LEN};

/// Frame opcodes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    None = 0,
    TerminateSession = 1,
    ResetSessions = 2,
    ListDirectory = 3,
    OpenFileRO = 4,
    ReadFile = 5,
    CreateFile = 6,
    WriteFile = 7,
    RemoveFile = 8,
    CreateDirectory = 9,
    RemoveDirectory = 10,
    OpenFileWO = 11,
    TruncateFile = 12,
    Rename = 13,
    CalcFileCRC32 = 14,
    BurstReadFile = 15,
    Ack = 128,
    Nak = 129,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Opcode::None,
            1 => Opcode::TerminateSession,
            2 => Opcode::ResetSessions,
            3 => Opcode::ListDirectory,
            4 => Opcode::OpenFileRO,
            5 => Opcode::ReadFile,
            6 => Opcode::CreateFile,
            7 => Opcode::WriteFile,
            8 => Opcode::RemoveFile,
            9 => Opcode::CreateDirectory,
            10 => Opcode::RemoveDirectory,
            11 => Opcode::OpenFileWO,
            12 => Opcode::TruncateFile,
            13 => Opcode::Rename,
            14 => Opcode::CalcFileCRC32,
            15 => Opcode::BurstReadFile,
            128 => Opcode::Ack,
            129 => Opcode::Nak,
            _ => return None,
        })
    }

    /// True for Ack and Nak
    pub fn is_reply(self) -> bool {
        matches!(self, Opcode::Ack | Opcode::Nak)
    }
}

/// One transfer frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub seq_number: u16,
    pub session: u8,
    pub opcode: Opcode,
    pub req_opcode: Opcode,
    pub burst_complete: bool,
    pub offset: u32,
    pub data: Vec<u8>,
}

impl Frame {
    /// Build a request frame; the sequence number is assigned when sent
    pub fn request(opcode: Opcode) -> Self {
        Self {
            seq_number: 0,
            session: 0,
            opcode,
            req_opcode: Opcode::None,
            burst_complete: false,
            offset: 0,
            data: Vec::new(),
        }
    }

    pub fn with_session(mut self, session: u8) -> Self {
        self.session = session;
        self
    }

    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    /// Attach payload bytes, truncated to the payload capacity
    pub fn with_data(mut self, data: &[u8]) -> Self {
        let n = data.len().min(MAX_DATA_LEN);
        self.data = data[..n].to_vec();
        self
    }

    /// Attach a path payload
    pub fn with_path(self, path: &str) -> Self {
        self.with_data(path.as_bytes())
    }

    /// Build an Ack answering `request`
    pub fn ack(request: &Frame) -> Self {
        Self {
            seq_number: request.seq_number.wrapping_add(1),
            session: request.session,
            opcode: Opcode::Ack,
            req_opcode: request.opcode,
            burst_complete: false,
            offset: request.offset,
            data: Vec::new(),
        }
    }

    /// Build a Nak answering `request`
    pub fn nak(request: &Frame, code: NakCode, errno: Option<u8>) -> Self {
        let mut data = vec![code as u8];
        if code == NakCode::FailErrno {
            data.push(errno.unwrap_or(0));
        }
        Self {
            seq_number: request.seq_number.wrapping_add(1),
            session: request.session,
            opcode: Opcode::Nak,
            req_opcode: request.opcode,
            burst_complete: false,
            offset: request.offset,
            data,
        }
    }

    /// Nak built for a frame whose opcode could not be decoded
    pub fn nak_unknown(seq_number: u16, opcode: u8) -> Self {
        Self {
            seq_number: seq_number.wrapping_add(1),
            session: 0,
            opcode: Opcode::Nak,
            req_opcode: Opcode::from_u8(opcode).unwrap_or(Opcode::None),
            burst_complete: false,
            offset: 0,
            data: vec![NakCode::UnknownCommand as u8],
        }
    }

    /// Wire error code of a Nak frame
    pub fn nak_code(&self) -> Option<NakCode> {
        if self.opcode != Opcode::Nak {
            return None;
        }
        Some(
            self.data
                .first()
                .and_then(|b| NakCode::from_u8(*b))
                .unwrap_or(NakCode::Fail),
        )
    }

    /// Payload interpreted as a UTF-8 path (stops at the first NUL)
    pub fn path(&self) -> Result<&str, DecodeError> {
        let end = self
            .data
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(self.data.len());
        std::str::from_utf8(&self.data[..end])
            .map_err(|e| DecodeError::Malformed(format!("path is not UTF-8: {}", e)))
    }

    /// Payload interpreted as two NUL-separated paths (Rename)
    pub fn path_pair(&self) -> Result<(&str, &str), DecodeError> {
        let split = self
            .data
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| DecodeError::Malformed("missing path separator".into()))?;
        let rest = &self.data[split + 1..];
        let end = rest.iter().position(|b| *b == 0).unwrap_or(rest.len());
        let from = std::str::from_utf8(&self.data[..split])
            .map_err(|e| DecodeError::Malformed(format!("path is not UTF-8: {}", e)))?;
        let to = std::str::from_utf8(&rest[..end])
            .map_err(|e| DecodeError::Malformed(format!("path is not UTF-8: {}", e)))?;
        Ok((from, to))
    }

    /// First four payload bytes as a little-endian u32
    ///
    /// Used for file sizes in open acks, checksums in CRC32 acks and
    /// byte budgets in burst requests.
    pub fn data_u32(&self) -> Option<u32> {
        if self.data.len() < 4 {
            return None;
        }
        let mut buf = &self.data[..4];
        Some(buf.get_u32_le())
    }

    /// CRC32 carried by a CalcFileCRC32 ack
    pub fn crc32(&self) -> Option<u32> {
        match (self.opcode, self.req_opcode) {
            (Opcode::Ack, Opcode::CalcFileCRC32) => self.data_u32(),
            _ => None,
        }
    }

    /// Encode into the wire layout
    pub fn encode(&self) -> Vec<u8> {
        let size = self.data.len().min(MAX_DATA_LEN);
        let mut buf = Vec::with_capacity(HEADER_LEN + size);
        buf.put_u16_le(self.seq_number);
        buf.put_u8(self.session);
        buf.put_u8(self.opcode as u8);
        buf.put_u8(size as u8);
        buf.put_u8(self.req_opcode as u8);
        buf.put_u8(self.burst_complete as u8);
        buf.put_u8(0);
        buf.put_u32_le(self.offset);
        buf.put_slice(&self.data[..size]);
        buf
    }

    /// Decode from the wire layout
    ///
    /// Bytes past `12 + size` are treated as transport padding.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < HEADER_LEN {
            return Err(DecodeError::Malformed(format!(
                "frame too short: {} bytes (header is {})",
                bytes.len(),
                HEADER_LEN
            )));
        }
        if bytes.len() > MAX_FRAME_LEN {
            return Err(DecodeError::Malformed(format!(
                "frame too long: {} bytes (max {})",
                bytes.len(),
                MAX_FRAME_LEN
            )));
        }

        let mut buf = bytes;
        let seq_number = buf.get_u16_le();
        let session = buf.get_u8();
        let raw_opcode = buf.get_u8();
        let size = buf.get_u8() as usize;
        let raw_req_opcode = buf.get_u8();
        let burst_complete = buf.get_u8() != 0;
        let _padding = buf.get_u8();
        let offset = buf.get_u32_le();

        if size > MAX_DATA_LEN {
            return Err(DecodeError::Malformed(format!(
                "declared size {} exceeds payload capacity {}",
                size, MAX_DATA_LEN
            )));
        }
        if buf.remaining() < size {
            return Err(DecodeError::Malformed(format!(
                "declared size {} but only {} payload bytes",
                size,
                buf.remaining()
            )));
        }

        let opcode = Opcode::from_u8(raw_opcode).ok_or(DecodeError::UnknownOpcode {
            opcode: raw_opcode,
            seq: seq_number,
        })?;
        // An unrecognised req_opcode only matters to the requester's matcher.
        let req_opcode = Opcode::from_u8(raw_req_opcode).unwrap_or(Opcode::None);

        Ok(Self {
            seq_number,
            session,
            opcode,
            req_opcode,
            burst_complete,
            offset,
            data: buf[..size].to_vec(),
        })
    }
}
