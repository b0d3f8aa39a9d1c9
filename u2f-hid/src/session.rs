use byteorder::ReadBytesExt;
use serde::Serialize;
use std::fmt;
use std::io::{self, Cursor, Read};
use tracing::{debug, trace};

use crate::channel::{ChannelId, BROADCAST_CHANNEL_ID};
use crate::device::HidDevice;
use crate::error::Error;
use crate::message::{encode, Message, Reassembler};
use crate::packet::{Packet, MAX_CONTINUATION_PACKETS};
use crate::{CapabilityFlags, CommandType, ErrorCode, INIT_NONCE_LEN, MAX_LOCK_SECONDS};

/// Nonce, channel id, protocol version, three device version bytes and capabilities.
const INIT_RESPONSE_LEN: usize = INIT_NONCE_LEN + 9;

/// Reports dropped while resynchronizing before giving up: two of the longest messages.
const RESYNC_REPORT_LIMIT: usize = 2 * (MAX_CONTINUATION_PACKETS + 1);

/// Device details returned by the INIT handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub channel_id: ChannelId,
    pub protocol_version: u8,
    pub major_version: u8,
    pub minor_version: u8,
    pub build_version: u8,
    pub capabilities: CapabilityFlags,
}

impl DeviceInfo {
    /// Parse an INIT response payload, which must echo `nonce` to be an answer to our request.
    pub fn decode(payload: &[u8], nonce: &[u8; INIT_NONCE_LEN]) -> Result<DeviceInfo, Error> {
        if payload.len() < INIT_RESPONSE_LEN {
            return Err(Error::Protocol("init response too short"));
        }

        let mut cursor = Cursor::new(payload);
        let mut echoed_nonce = [0u8; INIT_NONCE_LEN];
        cursor.read_exact(&mut echoed_nonce)?;
        if &echoed_nonce != nonce {
            return Err(Error::Protocol("not an answer to our request"));
        }

        Ok(DeviceInfo {
            channel_id: ChannelId::read(&mut cursor)?,
            protocol_version: cursor.read_u8()?,
            major_version: cursor.read_u8()?,
            minor_version: cursor.read_u8()?,
            build_version: cursor.read_u8()?,
            capabilities: CapabilityFlags::from_bits_truncate(cursor.read_u8()?),
        })
    }

    pub fn encode(&self, nonce: &[u8; INIT_NONCE_LEN]) -> Vec<u8> {
        let mut data = Vec::with_capacity(INIT_RESPONSE_LEN);
        data.extend_from_slice(nonce);
        data.extend_from_slice(&self.channel_id.0.to_be_bytes());
        data.push(self.protocol_version);
        data.push(self.major_version);
        data.push(self.minor_version);
        data.push(self.build_version);
        data.push(self.capabilities.bits());
        data
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Protocol: {}, Firmware: v{}.{}.{}, Capabilities: {:?}",
            self.protocol_version,
            self.major_version,
            self.minor_version,
            self.build_version,
            self.capabilities,
        )
    }
}

/// Outcome of a query for callers that handle error responses themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Response(Vec<u8>),
    Error(ErrorCode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    /// Another channel holds the lock, try again later.
    NotAcquired,
}

/// Request/response cycle with one open device.
///
/// Every query takes `&mut self`, so a new request can only be written after the previous
/// response has been read in full. A response that failed part way may have left reports
/// behind; the next query first runs a fresh INIT handshake and discards everything up to
/// its answer.
pub struct Session<D> {
    device: D,
    channel_id: ChannelId,
    info: Option<DeviceInfo>,
    needs_resync: bool,
}

impl<D> fmt::Debug for Session<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("channel_id", &self.channel_id)
            .field("info", &self.info)
            .field("needs_resync", &self.needs_resync)
            .finish()
    }
}

impl<D: HidDevice> Session<D> {
    /// Wrap a device that has not been through the INIT handshake yet.
    pub fn new(device: D) -> Session<D> {
        Session {
            device,
            channel_id: BROADCAST_CHANNEL_ID,
            info: None,
            needs_resync: false,
        }
    }

    /// Wrap a device and run the INIT handshake with a random nonce.
    pub async fn open(device: D) -> Result<Session<D>, Error> {
        let mut session = Session::new(device);
        session.init(rand::random()).await?;
        Ok(session)
    }

    /// The broadcast channel until the handshake completes, the allocated channel afterwards.
    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn info(&self) -> Option<&DeviceInfo> {
        self.info.as_ref()
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn into_device(self) -> D {
        self.device
    }

    /// Allocate a private channel. The nonce only correlates our request with its response on
    /// the shared broadcast channel.
    pub async fn init(&mut self, nonce: [u8; INIT_NONCE_LEN]) -> Result<DeviceInfo, Error> {
        if self.info.is_some() {
            return Err(Error::Protocol("handshake already completed"));
        }
        if self.needs_resync {
            return self.resync(nonce).await;
        }

        let payload = match self
            .exchange(BROADCAST_CHANNEL_ID, CommandType::Init, &nonce)
            .await?
        {
            Reply::Response(payload) => payload,
            Reply::Error(code) => return Err(Error::Device(code)),
        };

        self.accept(DeviceInfo::decode(&payload, &nonce)?)
    }

    /// True while leftover reports from a failed response may still be queued.
    pub fn needs_resync(&self) -> bool {
        self.needs_resync
    }

    /// Send INIT on the broadcast channel and drop every report until its answer arrives.
    async fn resync(&mut self, nonce: [u8; INIT_NONCE_LEN]) -> Result<DeviceInfo, Error> {
        debug!(channel_id = ?self.channel_id, "Resynchronizing channel");
        self.send(BROADCAST_CHANNEL_ID, CommandType::Init, &nonce).await?;

        for _ in 0..RESYNC_REPORT_LIMIT {
            let report = self.device.receive_report().await?;
            let payload = match Packet::from_bytes(&report) {
                Ok(Packet::Initialization {
                    channel_id: BROADCAST_CHANNEL_ID,
                    command: CommandType::Init,
                    data,
                    payload_len,
                }) => data.get(..payload_len as usize).map(<[u8]>::to_vec),
                _ => None,
            };
            match payload.map(|payload| DeviceInfo::decode(&payload, &nonce)) {
                Some(Ok(info)) => {
                    self.needs_resync = false;
                    return self.accept(info);
                }
                _ => trace!(report = ?report, "Discarding report while resynchronizing"),
            }
        }
        Err(Error::Protocol("device did not resynchronize"))
    }

    fn accept(&mut self, info: DeviceInfo) -> Result<DeviceInfo, Error> {
        if info.channel_id.is_broadcast() {
            return Err(Error::Protocol("device allocated the broadcast channel"));
        }

        debug!(channel_id = ?info.channel_id, %info, "Channel initialized");
        self.channel_id = info.channel_id;
        self.info = Some(info.clone());
        Ok(info)
    }

    /// Send a request and return the response payload, error responses become [Error::Device].
    pub async fn query(&mut self, command: CommandType, payload: &[u8]) -> Result<Vec<u8>, Error> {
        match self.query_raw(command, payload).await? {
            Reply::Response(payload) => Ok(payload),
            Reply::Error(code) => Err(Error::Device(code)),
        }
    }

    /// Send a request and return error responses as a value instead of failing.
    pub async fn query_raw(&mut self, command: CommandType, payload: &[u8]) -> Result<Reply, Error> {
        if self.needs_resync {
            self.resync(rand::random()).await?;
        }
        let channel_id = self.channel_id;
        self.exchange(channel_id, command, payload).await
    }

    /// Echo `data` through the device.
    pub async fn ping(&mut self, data: &[u8]) -> Result<(), Error> {
        let echo = self.query(CommandType::Ping, data).await?;
        if echo != data {
            return Err(Error::Protocol("device didn't echo ping"));
        }
        Ok(())
    }

    /// Ask the device to identify itself, typically by blinking.
    pub async fn wink(&mut self) -> Result<(), Error> {
        self.query(CommandType::Wink, &[]).await?;
        Ok(())
    }

    /// Lock the device to our channel for up to ten seconds, zero releases the lock.
    pub async fn lock(&mut self, seconds: u8) -> Result<LockOutcome, Error> {
        if seconds > MAX_LOCK_SECONDS {
            return Err(Error::InvalidLockTime(seconds));
        }
        match self.query_raw(CommandType::Lock, &[seconds]).await? {
            Reply::Response(_) => Ok(LockOutcome::Acquired),
            Reply::Error(ErrorCode::Busy) => Ok(LockOutcome::NotAcquired),
            Reply::Error(code) => Err(Error::Device(code)),
        }
    }

    /// Exchange an encapsulated raw U2F message.
    pub async fn msg(&mut self, apdu: &[u8]) -> Result<Vec<u8>, Error> {
        self.query(CommandType::Msg, apdu).await
    }

    async fn exchange(
        &mut self,
        channel_id: ChannelId,
        command: CommandType,
        payload: &[u8],
    ) -> Result<Reply, Error> {
        self.send(channel_id, command, payload).await?;

        let response = match self.receive().await {
            Ok(response) => response,
            Err(err) => {
                self.needs_resync = true;
                return Err(err);
            }
        };

        if response.channel_id != channel_id {
            return Err(Error::Protocol("bad channel"));
        }

        if response.command == CommandType::Error {
            let code = response
                .payload
                .first()
                .map(|byte| ErrorCode::from_byte(*byte))
                .ok_or(Error::Protocol("empty error response"))?;
            debug!(?channel_id, ?command, ?code, "Device returned error");
            return Ok(Reply::Error(code));
        }

        if response.command != command {
            return Err(Error::Protocol("bad command"));
        }

        Ok(Reply::Response(response.payload))
    }

    async fn send(
        &mut self,
        channel_id: ChannelId,
        command: CommandType,
        payload: &[u8],
    ) -> Result<(), Error> {
        let report_len = self.device.report_len();
        for report in encode(channel_id, command, payload, report_len)? {
            trace!(?channel_id, ?command, report = ?report, "Sending report");
            let written = self.device.send_report(&report).await?;
            if written != report.len() {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "device accepted a partial report",
                )
                .into());
            }
        }

        Ok(())
    }

    async fn receive(&mut self) -> Result<Message, Error> {
        let mut reassembler = Reassembler::new();
        loop {
            let report = self.device.receive_report().await?;
            trace!(channel_id = ?self.channel_id, report = ?report, "Received report");
            if let Some(message) = reassembler.push(&report)? {
                return Ok(message);
            }
        }
    }
}
