use std::io;
use thiserror::Error;

use crate::{device::ReportError, ErrorCode};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid packet ({reason}): {packet:02x?}")]
    InvalidPacket { reason: PacketError, packet: Vec<u8> },

    #[error("Message payload of {len} bytes does not fit in reports of {report_len} bytes")]
    MessageTooLarge { len: usize, report_len: usize },

    #[error("Report length {0} cannot carry a packet")]
    InvalidReportLength(usize),

    #[error("Protocol error: {0}")]
    Protocol(&'static str),

    #[error("Device returned error: {0:?}")]
    Device(ErrorCode),

    #[error("Lock time of {0} seconds is longer than allowed")]
    InvalidLockTime(u8),

    #[error("Device is gone")]
    DeviceGone,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Why a report could not be accepted as part of a message.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    #[error("shorter than packet header")]
    Truncated,

    #[error("expected an initialization packet")]
    ExpectedInitialization,

    #[error("expected a continuation packet")]
    ExpectedContinuation,

    #[error("declared payload length {0} exceeds maximum")]
    PayloadTooLong(u16),

    #[error("expected sequence number {expected}, got {actual}")]
    Sequence { expected: u8, actual: u8 },

    #[error("channel differs from initialization packet")]
    Channel,
}

impl Error {
    pub(crate) fn invalid_packet(reason: PacketError, packet: &[u8]) -> Error {
        Error::InvalidPacket {
            reason,
            packet: packet.to_vec(),
        }
    }

    /// True if the device was physically disconnected and should be forgotten.
    pub fn is_device_gone(&self) -> bool {
        matches!(self, Error::DeviceGone)
    }
}

impl From<ReportError> for Error {
    fn from(err: ReportError) -> Self {
        match err {
            ReportError::Disconnected => Error::DeviceGone,
            ReportError::Io(err) => Error::Io(err),
        }
    }
}
