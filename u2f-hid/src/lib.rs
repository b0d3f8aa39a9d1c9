//! Client side of the U2F HID protocol.
//!
//! Messages are split into fixed-size HID reports: one initialization packet followed by
//! as many continuation packets as the payload needs. A [Session](session::Session) runs the
//! broadcast INIT handshake to obtain a private channel and then performs one request/response
//! query at a time against a single [HidDevice](device::HidDevice).
//!
//! See:
//! - https://fidoalliance.org/specs/fido-u2f-v1.2-ps-20170411/fido-u2f-hid-protocol-v1.2-ps-20170411.html

mod channel;
mod device;
mod error;
mod message;
mod packet;
mod session;
pub mod simulated;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

pub use channel::{ChannelId, BROADCAST_CHANNEL_ID};
pub use device::{DeviceFactory, HidDevice, KeyIdentity, OpenOutcome, ReportError};
pub use error::{Error, PacketError};
pub use message::{decode, encode, max_payload_len, Message, Reassembler};
pub use packet::Packet;
pub use session::{DeviceInfo, LockOutcome, Reply, Session};

/// Size of the INIT request payload and of the nonce echoed back in the response.
pub const INIT_NONCE_LEN: usize = 8;

/// Longest lock a device can be asked to hold, in seconds.
pub const MAX_LOCK_SECONDS: u8 = 10;

const COMMAND_TYPE_MASK: u8 = 0b0111_1111;

// Command identifiers, without the initialization packet type bit
const U2FHID_PING: u8 = 0x01;
const U2FHID_MSG: u8 = 0x03;
const U2FHID_LOCK: u8 = 0x04;
const U2FHID_INIT: u8 = 0x06;
const U2FHID_WINK: u8 = 0x08;
const U2FHID_SYNC: u8 = 0x3c;
const U2FHID_ERROR: u8 = 0x3f;

const U2FHID_VENDOR_FIRST: u8 = 0x40; // First vendor defined command
const U2FHID_VENDOR_LAST: u8 = 0x7f; // Last vendor defined command

#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Debug, Hash)]
pub enum CommandType {
    Ping,  // Echo data through local processor only
    Msg,   // Send U2F message frame
    Lock,  // Send lock channel command
    Init,  // Channel initialization
    Wink,  // Send device identification wink
    Sync,  // Protocol resync command
    Error, // Error response
    Vendor { identifier: u8 },
    Unknown { identifier: u8 },
}

impl CommandType {
    pub fn from_byte(byte: u8) -> CommandType {
        match byte & COMMAND_TYPE_MASK {
            U2FHID_PING => CommandType::Ping,
            U2FHID_MSG => CommandType::Msg,
            U2FHID_LOCK => CommandType::Lock,
            U2FHID_INIT => CommandType::Init,
            U2FHID_WINK => CommandType::Wink,
            U2FHID_SYNC => CommandType::Sync,
            U2FHID_ERROR => CommandType::Error,
            id if (U2FHID_VENDOR_FIRST..=U2FHID_VENDOR_LAST).contains(&id) => {
                CommandType::Vendor { identifier: id }
            }
            id => CommandType::Unknown { identifier: id },
        }
    }

    /// Command identifier without the packet type bit, see [Packet::to_bytes] for where it is set.
    pub fn to_byte(&self) -> u8 {
        match self {
            CommandType::Ping => U2FHID_PING,
            CommandType::Msg => U2FHID_MSG,
            CommandType::Lock => U2FHID_LOCK,
            CommandType::Init => U2FHID_INIT,
            CommandType::Wink => U2FHID_WINK,
            CommandType::Sync => U2FHID_SYNC,
            CommandType::Error => U2FHID_ERROR,
            CommandType::Vendor { identifier } => *identifier & COMMAND_TYPE_MASK,
            CommandType::Unknown { identifier } => *identifier & COMMAND_TYPE_MASK,
        }
    }
}

bitflags! {
    #[derive(Serialize, Deserialize)]
    pub struct CapabilityFlags: u8 {
        const WINK = 0b0000_0001; // Device implements the WINK command
        const LOCK = 0b0000_0010; // Device implements the LOCK command
        const CBOR = 0b0000_0100; // Device implements CTAP2 CBOR messages
        const NMSG = 0b0000_1000; // Device DOES NOT implement the MSG command
    }
}

/// Error codes carried by the single payload byte of an ERROR response.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    None,
    InvalidCommand,
    InvalidParameter,
    InvalidLength,
    InvalidSequencing,
    Timeout,
    Busy,
    LockRequired,
    SyncFailed,
    Unspecified,
    Unknown { code: u8 },
}

impl ErrorCode {
    pub fn from_byte(byte: u8) -> ErrorCode {
        match byte {
            0x00 => ErrorCode::None,
            0x01 => ErrorCode::InvalidCommand,
            0x02 => ErrorCode::InvalidParameter,
            0x03 => ErrorCode::InvalidLength,
            0x04 => ErrorCode::InvalidSequencing,
            0x05 => ErrorCode::Timeout,
            0x06 => ErrorCode::Busy,
            0x0a => ErrorCode::LockRequired,
            0x0b => ErrorCode::SyncFailed,
            0x7f => ErrorCode::Unspecified,
            code => ErrorCode::Unknown { code },
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            ErrorCode::None => 0x00,
            ErrorCode::InvalidCommand => 0x01,
            ErrorCode::InvalidParameter => 0x02,
            ErrorCode::InvalidLength => 0x03,
            ErrorCode::InvalidSequencing => 0x04,
            ErrorCode::Timeout => 0x05,
            ErrorCode::Busy => 0x06,
            ErrorCode::LockRequired => 0x0a,
            ErrorCode::SyncFailed => 0x0b,
            ErrorCode::Unspecified => 0x7f,
            ErrorCode::Unknown { code } => code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_type_wire_values() {
        let commands = [
            (CommandType::Ping, 0x81),
            (CommandType::Msg, 0x83),
            (CommandType::Lock, 0x84),
            (CommandType::Init, 0x86),
            (CommandType::Wink, 0x88),
            (CommandType::Sync, 0xbc),
            (CommandType::Error, 0xbf),
        ];
        for (command, byte) in commands {
            assert_eq!(command.to_byte() | 0x80, byte);
            assert_eq!(CommandType::from_byte(byte), command);
        }
    }

    #[test]
    fn command_type_vendor_range() {
        assert_eq!(
            CommandType::from_byte(0xc0),
            CommandType::Vendor { identifier: 0x40 }
        );
        assert_eq!(
            CommandType::from_byte(0xff),
            CommandType::Vendor { identifier: 0x7f }
        );
        assert_eq!(
            CommandType::from_byte(0x90),
            CommandType::Unknown { identifier: 0x10 }
        );
    }

    #[test]
    fn error_code_bytes() {
        for byte in [0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x0a, 0x0b, 0x7f, 0x42] {
            assert_eq!(ErrorCode::from_byte(byte).to_byte(), byte);
        }
        assert_eq!(ErrorCode::from_byte(0x06), ErrorCode::Busy);
        assert_eq!(ErrorCode::from_byte(0x42), ErrorCode::Unknown { code: 0x42 });
    }

    #[test]
    fn capability_flags_truncate_unknown_bits() {
        assert_eq!(
            CapabilityFlags::from_bits_truncate(0b1000_0001),
            CapabilityFlags::WINK
        );
    }
}
