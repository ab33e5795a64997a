//! Control messages exchanged between clients and the driver.
//!
//! All fields are little endian. Strings and byte arrays are prefixed by an
//! `i32` length. Every message starts with the id that correlates it: the
//! client id plus correlation id for commands, the correlation id (or client
//! id for client-scoped notices) for responses.

#![allow(clippy::upper_case_acronyms)]

use crate::error::ErrorCode;
use crate::{Error, Result};

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandTypeId {
    AddPublication = 0x01,
    RemovePublication = 0x02,
    AddSubscription = 0x04,
    RemoveSubscription = 0x05,
    ClientKeepalive = 0x06,
    AddCounter = 0x09,
    RemoveCounter = 0x0A,
    ClientClose = 0x0B,
}

impl CommandTypeId {
    #[inline]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            0x01 => CommandTypeId::AddPublication,
            0x02 => CommandTypeId::RemovePublication,
            0x04 => CommandTypeId::AddSubscription,
            0x05 => CommandTypeId::RemoveSubscription,
            0x06 => CommandTypeId::ClientKeepalive,
            0x09 => CommandTypeId::AddCounter,
            0x0A => CommandTypeId::RemoveCounter,
            0x0B => CommandTypeId::ClientClose,
            _ => return None,
        })
    }
}

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseTypeId {
    OnError = 0x0F01,
    OnAvailableImage = 0x0F02,
    OnPublicationReady = 0x0F03,
    OnOperationSuccess = 0x0F04,
    OnUnavailableImage = 0x0F05,
    OnSubscriptionReady = 0x0F07,
    OnCounterReady = 0x0F08,
    OnClientTimeout = 0x0F0A,
}

impl ResponseTypeId {
    #[inline]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            0x0F01 => ResponseTypeId::OnError,
            0x0F02 => ResponseTypeId::OnAvailableImage,
            0x0F03 => ResponseTypeId::OnPublicationReady,
            0x0F04 => ResponseTypeId::OnOperationSuccess,
            0x0F05 => ResponseTypeId::OnUnavailableImage,
            0x0F07 => ResponseTypeId::OnSubscriptionReady,
            0x0F08 => ResponseTypeId::OnCounterReady,
            0x0F0A => ResponseTypeId::OnClientTimeout,
            _ => return None,
        })
    }
}

pub trait Message: Sized {
    fn encode(&self, out: &mut Vec<u8>);
    fn decode(bytes: &[u8]) -> Result<Self>;

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        self.encode(&mut out);
        out
    }
}

struct Decoder<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(Error::Corrupt("truncated control message"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn i32(&mut self) -> Result<i32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(i32::from_le_bytes(raw))
    }

    fn i64(&mut self) -> Result<i64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(i64::from_le_bytes(raw))
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.i32()?;
        if len < 0 {
            return Err(Error::Corrupt("negative length in control message"));
        }
        Ok(self.take(len as usize)?.to_vec())
    }

    fn string(&mut self) -> Result<String> {
        String::from_utf8(self.bytes()?).map_err(|_| Error::Corrupt("control message string is not utf-8"))
    }
}

fn put_i32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_i64(out: &mut Vec<u8>, value: i64) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_bytes(out: &mut Vec<u8>, value: &[u8]) {
    put_i32(out, value.len() as i32);
    out.extend_from_slice(value);
}

/// ADD_PUBLICATION and ADD_SUBSCRIPTION.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub client_id: i64,
    pub correlation_id: i64,
    pub stream_id: i32,
    pub channel: String,
}

impl Message for ChannelMessage {
    fn encode(&self, out: &mut Vec<u8>) {
        put_i64(out, self.client_id);
        put_i64(out, self.correlation_id);
        put_i32(out, self.stream_id);
        put_bytes(out, self.channel.as_bytes());
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(bytes);
        Ok(Self {
            client_id: d.i64()?,
            correlation_id: d.i64()?,
            stream_id: d.i32()?,
            channel: d.string()?,
        })
    }
}

/// REMOVE_PUBLICATION, REMOVE_SUBSCRIPTION and REMOVE_COUNTER.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveMessage {
    pub client_id: i64,
    pub correlation_id: i64,
    pub registration_id: i64,
}

impl Message for RemoveMessage {
    fn encode(&self, out: &mut Vec<u8>) {
        put_i64(out, self.client_id);
        put_i64(out, self.correlation_id);
        put_i64(out, self.registration_id);
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(bytes);
        Ok(Self {
            client_id: d.i64()?,
            correlation_id: d.i64()?,
            registration_id: d.i64()?,
        })
    }
}

/// CLIENT_KEEPALIVE and CLIENT_CLOSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelatedMessage {
    pub client_id: i64,
    pub correlation_id: i64,
}

impl Message for CorrelatedMessage {
    fn encode(&self, out: &mut Vec<u8>) {
        put_i64(out, self.client_id);
        put_i64(out, self.correlation_id);
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(bytes);
        Ok(Self {
            client_id: d.i64()?,
            correlation_id: d.i64()?,
        })
    }
}

/// ADD_COUNTER.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterMessage {
    pub client_id: i64,
    pub correlation_id: i64,
    pub type_id: i32,
    pub key: Vec<u8>,
    pub label: String,
}

impl Message for CounterMessage {
    fn encode(&self, out: &mut Vec<u8>) {
        put_i64(out, self.client_id);
        put_i64(out, self.correlation_id);
        put_i32(out, self.type_id);
        put_bytes(out, &self.key);
        put_bytes(out, self.label.as_bytes());
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(bytes);
        Ok(Self {
            client_id: d.i64()?,
            correlation_id: d.i64()?,
            type_id: d.i32()?,
            key: d.bytes()?,
            label: d.string()?,
        })
    }
}

/// ON_ERROR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub offending_correlation_id: i64,
    pub code: ErrorCode,
    pub message: String,
}

impl Message for ErrorResponse {
    fn encode(&self, out: &mut Vec<u8>) {
        put_i64(out, self.offending_correlation_id);
        put_i32(out, self.code.value());
        put_bytes(out, self.message.as_bytes());
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(bytes);
        Ok(Self {
            offending_correlation_id: d.i64()?,
            code: ErrorCode::from_value(d.i32()?),
            message: d.string()?,
        })
    }
}

/// ON_PUBLICATION_READY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicationReady {
    pub correlation_id: i64,
    pub registration_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub publication_limit_counter_id: i32,
    pub log_file: String,
}

impl Message for PublicationReady {
    fn encode(&self, out: &mut Vec<u8>) {
        put_i64(out, self.correlation_id);
        put_i64(out, self.registration_id);
        put_i32(out, self.session_id);
        put_i32(out, self.stream_id);
        put_i32(out, self.publication_limit_counter_id);
        put_bytes(out, self.log_file.as_bytes());
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(bytes);
        Ok(Self {
            correlation_id: d.i64()?,
            registration_id: d.i64()?,
            session_id: d.i32()?,
            stream_id: d.i32()?,
            publication_limit_counter_id: d.i32()?,
            log_file: d.string()?,
        })
    }
}

/// ON_SUBSCRIPTION_READY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionReady {
    pub correlation_id: i64,
    pub channel_status_indicator_id: i32,
}

impl Message for SubscriptionReady {
    fn encode(&self, out: &mut Vec<u8>) {
        put_i64(out, self.correlation_id);
        put_i32(out, self.channel_status_indicator_id);
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(bytes);
        Ok(Self {
            correlation_id: d.i64()?,
            channel_status_indicator_id: d.i32()?,
        })
    }
}

/// ON_AVAILABLE_IMAGE. `correlation_id` is the registration id of the
/// publication feeding the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReady {
    pub correlation_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub subscription_registration_id: i64,
    pub subscriber_position_id: i32,
    pub log_file: String,
    pub source_identity: String,
}

impl Message for ImageReady {
    fn encode(&self, out: &mut Vec<u8>) {
        put_i64(out, self.correlation_id);
        put_i32(out, self.session_id);
        put_i32(out, self.stream_id);
        put_i64(out, self.subscription_registration_id);
        put_i32(out, self.subscriber_position_id);
        put_bytes(out, self.log_file.as_bytes());
        put_bytes(out, self.source_identity.as_bytes());
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(bytes);
        Ok(Self {
            correlation_id: d.i64()?,
            session_id: d.i32()?,
            stream_id: d.i32()?,
            subscription_registration_id: d.i64()?,
            subscriber_position_id: d.i32()?,
            log_file: d.string()?,
            source_identity: d.string()?,
        })
    }
}

/// ON_UNAVAILABLE_IMAGE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMessage {
    pub correlation_id: i64,
    pub subscription_registration_id: i64,
    pub stream_id: i32,
    pub channel: String,
}

impl Message for ImageMessage {
    fn encode(&self, out: &mut Vec<u8>) {
        put_i64(out, self.correlation_id);
        put_i64(out, self.subscription_registration_id);
        put_i32(out, self.stream_id);
        put_bytes(out, self.channel.as_bytes());
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(bytes);
        Ok(Self {
            correlation_id: d.i64()?,
            subscription_registration_id: d.i64()?,
            stream_id: d.i32()?,
            channel: d.string()?,
        })
    }
}

/// ON_COUNTER_READY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterUpdate {
    pub correlation_id: i64,
    pub counter_id: i32,
}

impl Message for CounterUpdate {
    fn encode(&self, out: &mut Vec<u8>) {
        put_i64(out, self.correlation_id);
        put_i32(out, self.counter_id);
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(bytes);
        Ok(Self {
            correlation_id: d.i64()?,
            counter_id: d.i32()?,
        })
    }
}

/// ON_OPERATION_SUCCESS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationSucceeded {
    pub correlation_id: i64,
}

impl Message for OperationSucceeded {
    fn encode(&self, out: &mut Vec<u8>) {
        put_i64(out, self.correlation_id);
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(bytes);
        Ok(Self {
            correlation_id: d.i64()?,
        })
    }
}

/// ON_CLIENT_TIMEOUT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientTimeout {
    pub client_id: i64,
}

impl Message for ClientTimeout {
    fn encode(&self, out: &mut Vec<u8>) {
        put_i64(out, self.client_id);
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(bytes);
        Ok(Self {
            client_id: d.i64()?,
        })
    }
}
