//! Error types for the Skylink protocol

use thiserror::Error;

/// Frame decoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("unknown opcode {opcode} (seq {seq})")]
    UnknownOpcode { opcode: u8, seq: u16 },
}

/// Client-visible result kinds
///
/// `Next` is a progress marker delivered to transfer callbacks; every other
/// variant is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FtpResult {
    Success,
    Next,
    Timeout,
    Busy,
    FileDoesNotExist,
    FileExists,
    FileProtected,
    InvalidParameter,
    Unsupported,
    ProtocolError,
    Cancelled,
}

impl FtpResult {
    /// True for every kind except the `Next` progress marker
    pub fn is_terminal(self) -> bool {
        !matches!(self, FtpResult::Next)
    }

    /// Map a peer's negative acknowledgment onto a result kind
    pub fn from_nak(code: NakCode) -> Self {
        match code {
            NakCode::FileNotFound => FtpResult::FileDoesNotExist,
            NakCode::FileExists => FtpResult::FileExists,
            NakCode::FileProtected => FtpResult::FileProtected,
            NakCode::InvalidDataSize => FtpResult::InvalidParameter,
            NakCode::UnknownCommand => FtpResult::Unsupported,
            NakCode::NoSessionsAvailable => FtpResult::Busy,
            NakCode::None
            | NakCode::Fail
            | NakCode::FailErrno
            | NakCode::InvalidSession
            | NakCode::Eof => FtpResult::ProtocolError,
        }
    }
}

impl std::fmt::Display for FtpResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FtpResult::Success => "success",
            FtpResult::Next => "in progress",
            FtpResult::Timeout => "timed out",
            FtpResult::Busy => "busy",
            FtpResult::FileDoesNotExist => "file does not exist",
            FtpResult::FileExists => "file exists",
            FtpResult::FileProtected => "file protected",
            FtpResult::InvalidParameter => "invalid parameter",
            FtpResult::Unsupported => "unsupported",
            FtpResult::ProtocolError => "protocol error",
            FtpResult::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl std::error::Error for FtpResult {}

/// Wire error codes carried in the first payload byte of a Nak
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NakCode {
    None = 0,
    Fail = 1,
    FailErrno = 2,
    InvalidDataSize = 3,
    InvalidSession = 4,
    NoSessionsAvailable = 5,
    Eof = 6,
    UnknownCommand = 7,
    FileExists = 8,
    FileProtected = 9,
    FileNotFound = 10,
}

impl NakCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => NakCode::None,
            1 => NakCode::Fail,
            2 => NakCode::FailErrno,
            3 => NakCode::InvalidDataSize,
            4 => NakCode::InvalidSession,
            5 => NakCode::NoSessionsAvailable,
            6 => NakCode::Eof,
            7 => NakCode::UnknownCommand,
            8 => NakCode::FileExists,
            9 => NakCode::FileProtected,
            10 => NakCode::FileNotFound,
            _ => return None,
        })
    }

    /// Classify a filesystem error for the wire
    pub fn from_io(e: &std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => NakCode::FileNotFound,
            std::io::ErrorKind::AlreadyExists => NakCode::FileExists,
            std::io::ErrorKind::PermissionDenied => NakCode::FileProtected,
            _ if e.raw_os_error().is_some() => NakCode::FailErrno,
            _ => NakCode::Fail,
        }
    }
}

/// Outcome of registering a file for download on the server
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProvideResult {
    Success,
    Duplicate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nak_mapping() {
        assert_eq!(
            FtpResult::from_nak(NakCode::FileNotFound),
            FtpResult::FileDoesNotExist
        );
        assert_eq!(
            FtpResult::from_nak(NakCode::UnknownCommand),
            FtpResult::Unsupported
        );
        assert_eq!(
            FtpResult::from_nak(NakCode::InvalidDataSize),
            FtpResult::InvalidParameter
        );
        assert_eq!(FtpResult::from_nak(NakCode::Fail), FtpResult::ProtocolError);
    }

    #[test]
    fn test_nak_code_from_u8() {
        for v in 0..=10u8 {
            assert_eq!(NakCode::from_u8(v).map(|c| c as u8), Some(v));
        }
        assert!(NakCode::from_u8(11).is_none());
    }

    #[test]
    fn test_io_classification() {
        let e = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert_eq!(NakCode::from_io(&e), NakCode::FileNotFound);
        let e = std::io::Error::from(std::io::ErrorKind::AlreadyExists);
        assert_eq!(NakCode::from_io(&e), NakCode::FileExists);
        let e = std::io::Error::other("boom");
        assert_eq!(NakCode::from_io(&e), NakCode::Fail);
    }

    #[test]
    fn test_terminal() {
        assert!(!FtpResult::Next.is_terminal());
        assert!(FtpResult::Success.is_terminal());
        assert!(FtpResult::Timeout.is_terminal());
    }
}
