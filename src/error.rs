use crate::protocol::Command;
use crate::transport::TransportError;

/// Errors produced while talking to the BMS.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The trailing checksum byte does not match the 8-bit sum of the frame.
    #[error("Invalid checksum (calculated {calculated:#04x}, received {received:#04x})")]
    ChecksumMismatch { calculated: u8, received: u8 },
    /// The frame or payload is shorter than the protocol allows.
    #[error("Frame too short ({len} bytes, expected at least {expected})")]
    FrameTooShort { len: usize, expected: usize },
    /// No notification arrived within the configured timeout.
    #[error("Timeout waiting for response to {0:?}")]
    Timeout(Command),
    /// The underlying transport failed (connection, write, subscription).
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    /// The battery-state field carried a value outside the documented set.
    #[error("Unknown battery state {0}")]
    UnknownBatteryState(u16),
    #[error("{0}")]
    Generic(String),
}

impl Error {
    /// Process exit code for this error class.
    ///
    /// 0 is reserved for success; a truncated frame is indistinguishable
    /// from corruption at this level and shares the checksum code.
    pub fn error_code(&self) -> i32 {
        match self {
            Error::Generic(_) | Error::UnknownBatteryState(_) => 1,
            Error::Timeout(_) => 2,
            Error::Transport(_) => 4,
            Error::ChecksumMismatch { .. } | Error::FrameTooShort { .. } => 6,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::Generic("boom".into()).error_code(), 1);
        assert_eq!(Error::UnknownBatteryState(3).error_code(), 1);
        assert_eq!(Error::Timeout(Command::GetVersion).error_code(), 2);
        assert_eq!(
            Error::Transport(TransportError("device unreachable".into())).error_code(),
            4
        );
        assert_eq!(
            Error::ChecksumMismatch {
                calculated: 0x17,
                received: 0x18
            }
            .error_code(),
            6
        );
        assert_eq!(
            Error::FrameTooShort {
                len: 4,
                expected: 9
            }
            .error_code(),
            6
        );
    }
}
