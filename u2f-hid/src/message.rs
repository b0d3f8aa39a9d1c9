use tracing::trace;

use crate::channel::ChannelId;
use crate::error::{Error, PacketError};
use crate::packet::{
    Packet, CONTINUATION_PACKET_HEADER_LEN, INITIAL_PACKET_HEADER_LEN, MAX_CONTINUATION_PACKETS,
};
use crate::CommandType;

/// A complete message, independent of how it was split into reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub channel_id: ChannelId,
    pub command: CommandType,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(channel_id: ChannelId, command: CommandType, payload: Vec<u8>) -> Message {
        Message {
            channel_id,
            command,
            payload,
        }
    }

    pub fn to_reports(&self, report_len: usize) -> Result<Vec<Vec<u8>>, Error> {
        encode(self.channel_id, self.command, &self.payload, report_len)
    }
}

/// Largest payload one message can carry: an initialization packet plus every continuation
/// sequence number, capped by the 16 bit length field.
pub fn max_payload_len(report_len: usize) -> usize {
    if report_len <= INITIAL_PACKET_HEADER_LEN {
        return 0;
    }
    let len = (report_len - INITIAL_PACKET_HEADER_LEN)
        + MAX_CONTINUATION_PACKETS * (report_len - CONTINUATION_PACKET_HEADER_LEN);
    len.min(u16::MAX as usize)
}

/// Frame a message into zero padded reports of `report_len` bytes each.
pub fn encode(
    channel_id: ChannelId,
    command: CommandType,
    payload: &[u8],
    report_len: usize,
) -> Result<Vec<Vec<u8>>, Error> {
    Ok(
        Packet::encode_message(channel_id, command, payload, report_len)?
            .iter()
            .map(|packet| packet.to_bytes(report_len))
            .collect(),
    )
}

/// Reassemble a message from the reports it was framed into. Reports after the message is
/// complete are ignored; running out of reports before then is an error.
pub fn decode<'a, I>(reports: I) -> Result<Message, Error>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut reassembler = Reassembler::new();
    for report in reports {
        if let Some(message) = reassembler.push(report)? {
            return Ok(message);
        }
    }
    Err(Error::Protocol("message ended before declared payload length"))
}

/// Incremental reassembly, fed one received report at a time.
#[derive(Debug)]
pub struct Reassembler {
    state: State,
}

#[derive(Debug)]
enum State {
    Idle,
    Receiving {
        channel_id: ChannelId,
        command: CommandType,
        payload: Vec<u8>,
        payload_len: usize,
        next_sequence_number: u8,
    },
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    pub fn new() -> Reassembler {
        Reassembler { state: State::Idle }
    }

    /// True while a message has been started but not completed.
    pub fn is_receiving(&self) -> bool {
        matches!(self.state, State::Receiving { .. })
    }

    /// Accept the next report. Returns the message once its declared length has been received.
    /// Any error discards the partial message.
    pub fn push(&mut self, report: &[u8]) -> Result<Option<Message>, Error> {
        let result = self.push_packet(report);
        if result.is_err() {
            self.state = State::Idle;
        }
        result
    }

    fn push_packet(&mut self, report: &[u8]) -> Result<Option<Message>, Error> {
        let packet = Packet::from_bytes(report)?;
        trace!(?packet, "Reassembler::push");

        match packet {
            Packet::Initialization {
                channel_id,
                command,
                mut data,
                payload_len,
            } => {
                if self.is_receiving() {
                    return Err(Error::invalid_packet(
                        PacketError::ExpectedContinuation,
                        report,
                    ));
                }
                let payload_len = payload_len as usize;
                if payload_len > max_payload_len(report.len()) {
                    return Err(Error::invalid_packet(
                        PacketError::PayloadTooLong(payload_len as u16),
                        report,
                    ));
                }
                if data.len() >= payload_len {
                    data.truncate(payload_len);
                    return Ok(Some(Message::new(channel_id, command, data)));
                }
                self.state = State::Receiving {
                    channel_id,
                    command,
                    payload: data,
                    payload_len,
                    next_sequence_number: 0,
                };
                Ok(None)
            }
            Packet::Continuation {
                channel_id,
                sequence_number,
                data,
            } => {
                let (payload, payload_len, next_sequence_number) = match &mut self.state {
                    State::Idle => {
                        return Err(Error::invalid_packet(
                            PacketError::ExpectedInitialization,
                            report,
                        ))
                    }
                    State::Receiving {
                        channel_id: expected_channel_id,
                        payload,
                        payload_len,
                        next_sequence_number,
                        ..
                    } => {
                        if channel_id != *expected_channel_id {
                            return Err(Error::invalid_packet(PacketError::Channel, report));
                        }
                        (payload, *payload_len, next_sequence_number)
                    }
                };

                if sequence_number != *next_sequence_number {
                    return Err(Error::invalid_packet(
                        PacketError::Sequence {
                            expected: *next_sequence_number,
                            actual: sequence_number,
                        },
                        report,
                    ));
                }
                *next_sequence_number += 1;

                let needed = payload_len - payload.len();
                payload.extend_from_slice(&data[..data.len().min(needed)]);
                if payload.len() < payload_len {
                    return Ok(None);
                }

                let message = match std::mem::replace(&mut self.state, State::Idle) {
                    State::Receiving {
                        channel_id,
                        command,
                        payload,
                        ..
                    } => Some(Message::new(channel_id, command, payload)),
                    State::Idle => None,
                };
                Ok(message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::channel::BROADCAST_CHANNEL_ID;

    use super::*;

    fn decode_reports(reports: &[Vec<u8>]) -> Result<Message, Error> {
        decode(reports.iter().map(Vec::as_slice))
    }

    #[test]
    fn round_trip_across_payload_sizes() {
        for report_len in [8, 64] {
            let max = 4 * report_len;
            for len in 0..=max {
                let payload: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
                let reports =
                    encode(ChannelId(0x0102_0304), CommandType::Msg, &payload, report_len).unwrap();

                assert!(reports.iter().all(|report| report.len() == report_len));
                assert_eq!(
                    decode_reports(&reports).unwrap(),
                    Message::new(ChannelId(0x0102_0304), CommandType::Msg, payload)
                );
            }
        }
    }

    #[test]
    fn hundred_bytes_in_sixty_four_byte_reports() {
        let payload: Vec<u8> = (0u8..100).collect();

        let packets =
            Packet::encode_message(ChannelId(1), CommandType::Msg, &payload, 64).unwrap();
        assert_matches!(&packets[..], [
            Packet::Initialization { data: first, payload_len: 100, .. },
            Packet::Continuation { data: second, sequence_number: 0, .. },
        ] => {
            assert_eq!(first.len(), 57);
            assert_eq!(second.len(), 43);
        });

        let reports = encode(ChannelId(1), CommandType::Msg, &payload, 64).unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1][4], 0);
        assert_eq!(decode_reports(&reports).unwrap().payload, payload);
    }

    #[test]
    fn out_of_order_continuations_are_rejected() {
        let payload: Vec<u8> = (0u8..200).collect();
        let mut reports = encode(ChannelId(1), CommandType::Msg, &payload, 64).unwrap();
        assert_eq!(reports.len(), 4);
        reports.swap(1, 2);

        assert_matches!(
            decode_reports(&reports),
            Err(Error::InvalidPacket {
                reason: PacketError::Sequence {
                    expected: 0,
                    actual: 1
                },
                ..
            })
        );
    }

    #[test]
    fn sequence_gap_is_rejected() {
        let payload: Vec<u8> = (0u8..200).collect();
        let mut reports = encode(ChannelId(1), CommandType::Msg, &payload, 64).unwrap();
        reports.remove(2);

        assert_matches!(
            decode_reports(&reports),
            Err(Error::InvalidPacket {
                reason: PacketError::Sequence {
                    expected: 1,
                    actual: 2
                },
                ..
            })
        );
    }

    #[test]
    fn repeated_continuation_is_rejected() {
        let payload: Vec<u8> = (0u8..200).collect();
        let mut reports = encode(ChannelId(1), CommandType::Msg, &payload, 64).unwrap();
        let repeat = reports[1].clone();
        reports.insert(2, repeat);

        assert_matches!(
            decode_reports(&reports),
            Err(Error::InvalidPacket {
                reason: PacketError::Sequence { .. },
                ..
            })
        );
    }

    #[test]
    fn missing_continuations_never_truncate() {
        let payload: Vec<u8> = (0u8..100).collect();
        let reports = encode(ChannelId(1), CommandType::Msg, &payload, 64).unwrap();

        assert_matches!(decode_reports(&reports[..1]), Err(Error::Protocol(_)));
    }

    #[test]
    fn continuation_on_other_channel_is_rejected() {
        let payload: Vec<u8> = (0u8..100).collect();
        let mut reports = encode(ChannelId(1), CommandType::Msg, &payload, 64).unwrap();
        reports[1][..4].copy_from_slice(&[0, 0, 0, 2]);

        let err = decode_reports(&reports).unwrap_err();
        assert_matches!(err, Error::InvalidPacket { reason: PacketError::Channel, ref packet } => {
            assert_eq!(packet, &reports[1]);
        });
    }

    #[test]
    fn continuation_first_is_rejected() {
        let payload: Vec<u8> = (0u8..100).collect();
        let reports = encode(ChannelId(1), CommandType::Msg, &payload, 64).unwrap();

        assert_matches!(
            decode_reports(&reports[1..]),
            Err(Error::InvalidPacket {
                reason: PacketError::ExpectedInitialization,
                ..
            })
        );
    }

    #[test]
    fn initialization_while_receiving_is_rejected() {
        let payload: Vec<u8> = (0u8..100).collect();
        let reports = encode(ChannelId(1), CommandType::Msg, &payload, 64).unwrap();

        let mut reassembler = Reassembler::new();
        assert_matches!(reassembler.push(&reports[0]), Ok(None));
        assert!(reassembler.is_receiving());
        assert_matches!(
            reassembler.push(&reports[0]),
            Err(Error::InvalidPacket {
                reason: PacketError::ExpectedContinuation,
                ..
            })
        );
        assert!(!reassembler.is_receiving());
    }

    #[test]
    fn declared_length_above_maximum_is_rejected() {
        let mut report = vec![0u8; 8];
        report[..4].copy_from_slice(&BROADCAST_CHANNEL_ID.0.to_be_bytes());
        report[4] = 0x83;
        report[5..7].copy_from_slice(&0xffffu16.to_be_bytes());

        assert_matches!(
            decode([&report[..]]),
            Err(Error::InvalidPacket {
                reason: PacketError::PayloadTooLong(0xffff),
                ..
            })
        );
    }

    #[test]
    fn reassembler_is_reusable() {
        let mut reassembler = Reassembler::new();
        for payload in [vec![1u8; 10], vec![2u8; 150]] {
            let reports = encode(ChannelId(3), CommandType::Ping, &payload, 64).unwrap();
            let mut result = None;
            for report in &reports {
                result = reassembler.push(report).unwrap();
            }
            assert_eq!(result.unwrap().payload, payload);
        }
    }
}
