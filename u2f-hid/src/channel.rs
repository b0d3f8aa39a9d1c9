use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;

/// Channel reserved for the INIT handshake, every other command uses an allocated channel.
pub const BROADCAST_CHANNEL_ID: ChannelId = ChannelId(0xffff_ffff);
const MAX_CHANNEL_ID: ChannelId = ChannelId(BROADCAST_CHANNEL_ID.0 - 1);
const MIN_CHANNEL_ID: ChannelId = ChannelId(1);

#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Serialize, Deserialize, Hash)]
pub struct ChannelId(pub u32);

impl ChannelId {
    pub fn is_broadcast(self) -> bool {
        self == BROADCAST_CHANNEL_ID
    }

    pub fn checked_add(self, number: u32) -> Option<ChannelId> {
        self.0.checked_add(number).and_then(|id| {
            // Do not overflow into the broadcast channel.
            if id == BROADCAST_CHANNEL_ID.0 {
                None
            } else {
                Some(ChannelId(id))
            }
        })
    }

    pub fn read<R: ReadBytesExt>(read: &mut R) -> io::Result<ChannelId> {
        Ok(ChannelId(read.read_u32::<BigEndian>()?))
    }

    pub fn write<W: WriteBytesExt>(&self, write: &mut W) -> io::Result<()> {
        write.write_u32::<BigEndian>(self.0)
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({:#010x})", self.0)
    }
}

/// Device side channel allocation, hands out increasing ids and never the broadcast id.
#[derive(Debug)]
pub(crate) struct Channels {
    next_allocation: ChannelId,
}

impl Channels {
    pub fn new() -> Channels {
        Channels {
            next_allocation: MIN_CHANNEL_ID,
        }
    }

    pub fn allocate(&mut self) -> Option<ChannelId> {
        if self.next_allocation > MAX_CHANNEL_ID {
            None
        } else {
            let allocation = self.next_allocation;
            self.next_allocation = self
                .next_allocation
                .checked_add(1)
                .unwrap_or(ChannelId(BROADCAST_CHANNEL_ID.0));
            Some(allocation)
        }
    }

    pub fn is_allocated(&self, channel_id: ChannelId) -> bool {
        channel_id >= MIN_CHANNEL_ID && channel_id < self.next_allocation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_id_checked_add() {
        assert_eq!(ChannelId(1).checked_add(1), Some(ChannelId(2)));
        assert_eq!(ChannelId(0xffff_fffe).checked_add(1), None);
        assert_eq!(ChannelId(0xffff_fffe).checked_add(2), None);
    }

    #[test]
    fn channel_id_write() {
        let mut buf = Vec::new();
        ChannelId(0x01020304).write(&mut buf).unwrap();
        assert_eq!(buf, vec![1, 2, 3, 4]);
    }

    #[test]
    fn channel_id_read() {
        let mut cursor = io::Cursor::new(vec![0xca, 0xfe, 0xba, 0xbe]);
        assert_eq!(ChannelId::read(&mut cursor).unwrap(), ChannelId(0xcafe_babe));
    }

    #[test]
    fn channels_allocate_in_order() {
        let mut channels = Channels::new();
        assert_eq!(channels.allocate(), Some(ChannelId(1)));
        assert_eq!(channels.allocate(), Some(ChannelId(2)));
        assert!(channels.is_allocated(ChannelId(2)));
        assert!(!channels.is_allocated(ChannelId(3)));
        assert!(!channels.is_allocated(BROADCAST_CHANNEL_ID));
    }

    #[test]
    fn channels_never_allocate_broadcast() {
        let mut channels = Channels {
            next_allocation: MAX_CHANNEL_ID,
        };
        assert_eq!(channels.allocate(), Some(MAX_CHANNEL_ID));
        assert_eq!(channels.allocate(), None);
    }
}
