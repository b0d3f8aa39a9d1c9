use byteorder::{BigEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::cmp;
use std::io::Cursor;

use crate::channel::ChannelId;
use crate::error::{Error, PacketError};
use crate::CommandType;

pub(crate) const INITIAL_PACKET_HEADER_LEN: usize = 7;
pub(crate) const CONTINUATION_PACKET_HEADER_LEN: usize = 5;

/// Continuation sequence numbers run 0x00..=0x7f, bit 7 is the packet type.
pub(crate) const MAX_CONTINUATION_PACKETS: usize = 0x80;

const FRAME_TYPE_INIT: u8 = 0b1000_0000;
const FRAME_TYPE_CONT: u8 = 0b0000_0000;
const FRAME_TYPE_MASK: u8 = 0b1000_0000;

/// One HID report worth of a message.
///
/// Both kinds start with the 4 byte channel id. Byte 4 has bit 7 set for an initialization
/// packet, where it holds the command and is followed by the 16 bit payload length. With
/// bit 7 cleared it is the sequence number of a continuation packet.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub enum Packet {
    /// Starts a message: command, total payload length and the first `report_len - 7` bytes.
    Initialization {
        channel_id: ChannelId,
        command: CommandType,
        data: Vec<u8>,
        payload_len: u16,
    },
    /// Carries the next `report_len - 5` bytes, sequence numbers count up from zero.
    Continuation {
        channel_id: ChannelId,
        sequence_number: u8,
        data: Vec<u8>,
    },
}

impl Packet {
    pub fn channel_id(&self) -> ChannelId {
        match self {
            Packet::Initialization { channel_id, .. } => *channel_id,
            Packet::Continuation { channel_id, .. } => *channel_id,
        }
    }

    /// Parse one received report. Data runs to the end of the report, including any zero
    /// padding; only the message reassembly knows how much of it is payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Packet, Error> {
        if bytes.len() < CONTINUATION_PACKET_HEADER_LEN {
            return Err(Error::invalid_packet(PacketError::Truncated, bytes));
        }
        let mut reader = Cursor::new(bytes);

        let channel_id = ChannelId::read(&mut reader)?;
        let first_byte = reader.read_u8()?;
        if first_byte & FRAME_TYPE_MASK == FRAME_TYPE_INIT {
            if bytes.len() < INITIAL_PACKET_HEADER_LEN {
                return Err(Error::invalid_packet(PacketError::Truncated, bytes));
            }
            let command = CommandType::from_byte(first_byte);
            let payload_len = reader.read_u16::<BigEndian>()?;
            Ok(Packet::Initialization {
                channel_id,
                command,
                data: bytes[INITIAL_PACKET_HEADER_LEN..].to_vec(),
                payload_len,
            })
        } else {
            Ok(Packet::Continuation {
                channel_id,
                sequence_number: first_byte,
                data: bytes[CONTINUATION_PACKET_HEADER_LEN..].to_vec(),
            })
        }
    }

    /// Serialize into a report of exactly `report_len` bytes, zero padded.
    pub fn to_bytes(&self, report_len: usize) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(report_len);
        match self {
            Packet::Initialization {
                channel_id,
                command,
                data,
                payload_len,
            } => {
                debug_assert!(
                    data.len() <= report_len.saturating_sub(INITIAL_PACKET_HEADER_LEN)
                );
                bytes.extend_from_slice(&channel_id.0.to_be_bytes());
                bytes.push(command.to_byte() | FRAME_TYPE_INIT);
                bytes.extend_from_slice(&payload_len.to_be_bytes());
                bytes.extend_from_slice(data);
            }
            Packet::Continuation {
                channel_id,
                sequence_number,
                data,
            } => {
                debug_assert!(
                    data.len() <= report_len.saturating_sub(CONTINUATION_PACKET_HEADER_LEN)
                );
                debug_assert_eq!(sequence_number & FRAME_TYPE_MASK, FRAME_TYPE_CONT);
                bytes.extend_from_slice(&channel_id.0.to_be_bytes());
                bytes.push(*sequence_number);
                bytes.extend_from_slice(data);
            }
        }

        bytes.resize(report_len, 0u8);
        bytes
    }

    /// Split a message into packets for reports of `report_len` bytes. The last continuation
    /// packet carries exactly the remaining bytes.
    pub(crate) fn encode_message(
        channel_id: ChannelId,
        command: CommandType,
        data: &[u8],
        report_len: usize,
    ) -> Result<Vec<Packet>, Error> {
        if report_len <= INITIAL_PACKET_HEADER_LEN {
            return Err(Error::InvalidReportLength(report_len));
        }
        if data.len() > crate::message::max_payload_len(report_len) {
            return Err(Error::MessageTooLarge {
                len: data.len(),
                report_len,
            });
        }

        let payload_len = data.len() as u16;
        let (initial, remaining) =
            data.split_at(cmp::min(data.len(), report_len - INITIAL_PACKET_HEADER_LEN));
        let mut packets = vec![Packet::Initialization {
            channel_id,
            command,
            payload_len,
            data: initial.to_vec(),
        }];
        for (i, chunk) in remaining
            .chunks(report_len - CONTINUATION_PACKET_HEADER_LEN)
            .enumerate()
        {
            packets.push(Packet::Continuation {
                channel_id,
                sequence_number: i as u8,
                data: chunk.to_vec(),
            });
        }
        Ok(packets)
    }
}
