//! Raw U2F messages carried inside HID MSG commands.
//!
//! Requests use extended length encoding only. Signatures, certificates and public keys are
//! carried as opaque bytes and never verified here.
//!
//! See:
//! - https://fidoalliance.org/specs/fido-u2f-v1.2-ps-20170411/fido-u2f-raw-message-formats-v1.2-ps-20170411.html

use byteorder::{BigEndian, ReadBytesExt};
use std::fmt;
use std::io::{Cursor, Read};

use crate::error::Error;

const REGISTER_COMMAND_CODE: u8 = 0x01;
const AUTHENTICATE_COMMAND_CODE: u8 = 0x02;
const VERSION_COMMAND_CODE: u8 = 0x03;

const SW_NO_ERROR: u16 = 0x9000;
const SW_CONDITIONS_NOT_SATISFIED: u16 = 0x6985;
const SW_WRONG_DATA: u16 = 0x6A80;

const AUTH_ENFORCE: u8 = 0x03;

const REGISTER_RESERVED_BYTE: u8 = 0x05;
const USER_PUBLIC_KEY_LEN: usize = 65;
const USER_PRESENCE_FLAG: u8 = 0x01;

pub const MAX_KEY_HANDLE_LEN: usize = 255;

/// Version string every U2F 1.2 device answers with.
pub const U2F_V2: &str = "U2F_V2";

pub type Challenge = [u8; 32];
pub type Application = [u8; 32];

/// Opaque credential identifier issued by a key during registration.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct KeyHandle(Vec<u8>);

impl KeyHandle {
    pub fn from_bytes(bytes: &[u8]) -> Result<KeyHandle, Error> {
        if bytes.len() > MAX_KEY_HANDLE_LEN {
            return Err(Error::KeyHandleTooLong(bytes.len()));
        }
        Ok(KeyHandle(bytes.to_vec()))
    }
}

impl AsRef<[u8]> for KeyHandle {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for KeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyHandle({} bytes)", self.0.len())
    }
}

/// Trailing two bytes of every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusWord {
    NoError,
    TestOfUserPresenceRequired,
    InvalidKeyHandle,
    Other(u16),
}

impl StatusWord {
    pub fn from_u16(value: u16) -> StatusWord {
        match value {
            SW_NO_ERROR => StatusWord::NoError,
            SW_CONDITIONS_NOT_SATISFIED => StatusWord::TestOfUserPresenceRequired,
            SW_WRONG_DATA => StatusWord::InvalidKeyHandle,
            other => StatusWord::Other(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            StatusWord::NoError => SW_NO_ERROR,
            StatusWord::TestOfUserPresenceRequired => SW_CONDITIONS_NOT_SATISFIED,
            StatusWord::InvalidKeyHandle => SW_WRONG_DATA,
            StatusWord::Other(value) => value,
        }
    }
}

/// Separate response data from the status word that ends it.
pub fn split_status(response: &[u8]) -> Result<(&[u8], StatusWord), Error> {
    if response.len() < 2 {
        return Err(Error::InvalidResponse("shorter than status word"));
    }
    let (data, status) = response.split_at(response.len() - 2);
    let status = u16::from_be_bytes([status[0], status[1]]);
    Ok((data, StatusWord::from_u16(status)))
}

/// CLA, INS, P1, P2, extended Lc, request data, then Le asking for the maximum response length.
fn encode_request(command_code: u8, parameter1: u8, parameter2: u8, data: &[u8]) -> Vec<u8> {
    debug_assert!(data.len() <= u16::MAX as usize);
    let mut bytes = Vec::with_capacity(data.len() + 9);
    bytes.push(0);
    bytes.push(command_code);
    bytes.push(parameter1);
    bytes.push(parameter2);
    bytes.push(0);
    bytes.extend_from_slice(&(data.len() as u16).to_be_bytes());
    bytes.extend_from_slice(data);
    bytes.extend_from_slice(&[0, 0]);
    bytes
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterRequest {
    pub challenge: Challenge,
    pub application: Application,
}

impl RegisterRequest {
    pub fn to_apdu(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(64);
        data.extend_from_slice(&self.challenge);
        data.extend_from_slice(&self.application);
        encode_request(REGISTER_COMMAND_CODE, 0, 0, &data)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterResponse {
    pub user_public_key: Vec<u8>,
    pub key_handle: KeyHandle,
    pub attestation_certificate: Vec<u8>,
    pub signature: Vec<u8>,
}

impl RegisterResponse {
    /// Parse response data, without the status word.
    pub fn parse(data: &[u8]) -> Result<RegisterResponse, Error> {
        let mut reader = Cursor::new(data);

        let reserved = read_u8(&mut reader)?;
        if reserved != REGISTER_RESERVED_BYTE {
            return Err(Error::InvalidResponse("bad reserved byte"));
        }

        let user_public_key = read_exact(&mut reader, USER_PUBLIC_KEY_LEN)?;

        let key_handle_len = read_u8(&mut reader)? as usize;
        let key_handle = KeyHandle(read_exact(&mut reader, key_handle_len)?);

        let rest = &data[reader.position() as usize..];
        let certificate_len = der_len(rest)?;
        if certificate_len >= rest.len() {
            return Err(Error::InvalidResponse("missing signature"));
        }
        let (attestation_certificate, signature) = rest.split_at(certificate_len);

        Ok(RegisterResponse {
            user_public_key,
            key_handle,
            attestation_certificate: attestation_certificate.to_vec(),
            signature: signature.to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignRequest {
    pub challenge: Challenge,
    pub application: Application,
    pub key_handle: KeyHandle,
}

impl SignRequest {
    pub fn to_apdu(&self) -> Vec<u8> {
        let key_handle = self.key_handle.as_ref();
        let mut data = Vec::with_capacity(65 + key_handle.len());
        data.extend_from_slice(&self.challenge);
        data.extend_from_slice(&self.application);
        data.push(key_handle.len() as u8);
        data.extend_from_slice(key_handle);
        encode_request(AUTHENTICATE_COMMAND_CODE, AUTH_ENFORCE, 0, &data)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignResponse {
    pub user_present: bool,
    pub counter: u32,
    pub signature: Vec<u8>,
}

impl SignResponse {
    /// Parse response data, without the status word.
    pub fn parse(data: &[u8]) -> Result<SignResponse, Error> {
        let mut reader = Cursor::new(data);

        let user_presence = read_u8(&mut reader)?;
        let counter = reader
            .read_u32::<BigEndian>()
            .map_err(|_| Error::InvalidResponse("truncated counter"))?;
        let signature = data[reader.position() as usize..].to_vec();
        if signature.is_empty() {
            return Err(Error::InvalidResponse("missing signature"));
        }

        Ok(SignResponse {
            user_present: user_presence & USER_PRESENCE_FLAG != 0,
            counter,
            signature,
        })
    }
}

pub fn version_request() -> Vec<u8> {
    encode_request(VERSION_COMMAND_CODE, 0, 0, &[])
}

pub fn parse_version(data: &[u8]) -> Result<String, Error> {
    String::from_utf8(data.to_vec()).map_err(|_| Error::InvalidResponse("version is not UTF-8"))
}

fn read_u8(reader: &mut Cursor<&[u8]>) -> Result<u8, Error> {
    reader
        .read_u8()
        .map_err(|_| Error::InvalidResponse("truncated"))
}

fn read_exact(reader: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>, Error> {
    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .map_err(|_| Error::InvalidResponse("truncated"))?;
    Ok(bytes)
}

/// Total length of the DER element at the start of `bytes`, header included.
fn der_len(bytes: &[u8]) -> Result<usize, Error> {
    let truncated = Error::InvalidResponse("truncated certificate");
    let (header_len, content_len) = match bytes {
        [_, len, ..] if *len < 0x80 => (2, *len as usize),
        [_, 0x81, len, ..] => (3, *len as usize),
        [_, 0x82, hi, lo, ..] => (4, u16::from_be_bytes([*hi, *lo]) as usize),
        [_, _, ..] => return Err(Error::InvalidResponse("unsupported certificate length")),
        _ => return Err(truncated),
    };
    let len = header_len + content_len;
    if len > bytes.len() {
        return Err(truncated);
    }
    Ok(len)
}
