//! Content headers and the `basic` class properties
//!
//! A content-bearing method is followed by exactly one HEADER frame carrying
//! the total body size and the message properties, then by BODY frames. The
//! properties are encoded behind a 16-bit flag word, most significant flag
//! first, with only the present properties serialized.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::types::{ensure, FieldTable, ShortString, Timestamp};
use crate::Error;

const FLAG_CONTENT_TYPE: u16 = 1 << 15;
const FLAG_CONTENT_ENCODING: u16 = 1 << 14;
const FLAG_HEADERS: u16 = 1 << 13;
const FLAG_DELIVERY_MODE: u16 = 1 << 12;
const FLAG_PRIORITY: u16 = 1 << 11;
const FLAG_CORRELATION_ID: u16 = 1 << 10;
const FLAG_REPLY_TO: u16 = 1 << 9;
const FLAG_EXPIRATION: u16 = 1 << 8;
const FLAG_MESSAGE_ID: u16 = 1 << 7;
const FLAG_TIMESTAMP: u16 = 1 << 6;
const FLAG_TYPE: u16 = 1 << 5;
const FLAG_USER_ID: u16 = 1 << 4;
const FLAG_APP_ID: u16 = 1 << 3;
const FLAG_CLUSTER_ID: u16 = 1 << 2;

/// Delivery mode of a published message
pub mod delivery_mode {
    /// Message is discarded on broker restart
    pub const TRANSIENT: u8 = 1;
    /// Message is written to disk if the queue is durable
    pub const PERSISTENT: u8 = 2;
}

/// Properties of the `basic` content class
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BasicProperties {
    /// MIME content type
    pub content_type: Option<ShortString>,
    /// MIME content encoding
    pub content_encoding: Option<ShortString>,
    /// Application headers
    pub headers: Option<FieldTable>,
    /// 1 transient, 2 persistent
    pub delivery_mode: Option<u8>,
    /// Priority 0..=9
    pub priority: Option<u8>,
    /// Application correlation identifier
    pub correlation_id: Option<ShortString>,
    /// Address to reply to
    pub reply_to: Option<ShortString>,
    /// Message expiration, milliseconds as a string
    pub expiration: Option<ShortString>,
    /// Application message identifier
    pub message_id: Option<ShortString>,
    /// Message timestamp
    pub timestamp: Option<Timestamp>,
    /// Message type name
    pub kind: Option<ShortString>,
    /// Creating user id, validated by the server
    pub user_id: Option<ShortString>,
    /// Creating application id
    pub app_id: Option<ShortString>,
    /// Reserved cluster id
    pub cluster_id: Option<ShortString>,
}

impl BasicProperties {
    fn flags(&self) -> u16 {
        let mut flags = 0;
        if self.content_type.is_some() {
            flags |= FLAG_CONTENT_TYPE;
        }
        if self.content_encoding.is_some() {
            flags |= FLAG_CONTENT_ENCODING;
        }
        if self.headers.is_some() {
            flags |= FLAG_HEADERS;
        }
        if self.delivery_mode.is_some() {
            flags |= FLAG_DELIVERY_MODE;
        }
        if self.priority.is_some() {
            flags |= FLAG_PRIORITY;
        }
        if self.correlation_id.is_some() {
            flags |= FLAG_CORRELATION_ID;
        }
        if self.reply_to.is_some() {
            flags |= FLAG_REPLY_TO;
        }
        if self.expiration.is_some() {
            flags |= FLAG_EXPIRATION;
        }
        if self.message_id.is_some() {
            flags |= FLAG_MESSAGE_ID;
        }
        if self.timestamp.is_some() {
            flags |= FLAG_TIMESTAMP;
        }
        if self.kind.is_some() {
            flags |= FLAG_TYPE;
        }
        if self.user_id.is_some() {
            flags |= FLAG_USER_ID;
        }
        if self.app_id.is_some() {
            flags |= FLAG_APP_ID;
        }
        if self.cluster_id.is_some() {
            flags |= FLAG_CLUSTER_ID;
        }
        flags
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        dst.put_u16(self.flags());
        if let Some(v) = &self.content_type {
            v.encode(dst);
        }
        if let Some(v) = &self.content_encoding {
            v.encode(dst);
        }
        if let Some(v) = &self.headers {
            v.encode(dst);
        }
        if let Some(v) = self.delivery_mode {
            dst.put_u8(v);
        }
        if let Some(v) = self.priority {
            dst.put_u8(v);
        }
        if let Some(v) = &self.correlation_id {
            v.encode(dst);
        }
        if let Some(v) = &self.reply_to {
            v.encode(dst);
        }
        if let Some(v) = &self.expiration {
            v.encode(dst);
        }
        if let Some(v) = &self.message_id {
            v.encode(dst);
        }
        if let Some(v) = self.timestamp {
            dst.put_u64(v.0);
        }
        if let Some(v) = &self.kind {
            v.encode(dst);
        }
        if let Some(v) = &self.user_id {
            v.encode(dst);
        }
        if let Some(v) = &self.app_id {
            v.encode(dst);
        }
        if let Some(v) = &self.cluster_id {
            v.encode(dst);
        }
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        ensure(src, 2)?;
        let flags = src.get_u16();
        let mut props = Self::default();
        if flags & FLAG_CONTENT_TYPE != 0 {
            props.content_type = Some(ShortString::decode(src)?);
        }
        if flags & FLAG_CONTENT_ENCODING != 0 {
            props.content_encoding = Some(ShortString::decode(src)?);
        }
        if flags & FLAG_HEADERS != 0 {
            props.headers = Some(FieldTable::decode(src)?);
        }
        if flags & FLAG_DELIVERY_MODE != 0 {
            ensure(src, 1)?;
            props.delivery_mode = Some(src.get_u8());
        }
        if flags & FLAG_PRIORITY != 0 {
            ensure(src, 1)?;
            props.priority = Some(src.get_u8());
        }
        if flags & FLAG_CORRELATION_ID != 0 {
            props.correlation_id = Some(ShortString::decode(src)?);
        }
        if flags & FLAG_REPLY_TO != 0 {
            props.reply_to = Some(ShortString::decode(src)?);
        }
        if flags & FLAG_EXPIRATION != 0 {
            props.expiration = Some(ShortString::decode(src)?);
        }
        if flags & FLAG_MESSAGE_ID != 0 {
            props.message_id = Some(ShortString::decode(src)?);
        }
        if flags & FLAG_TIMESTAMP != 0 {
            ensure(src, 8)?;
            props.timestamp = Some(Timestamp(src.get_u64()));
        }
        if flags & FLAG_TYPE != 0 {
            props.kind = Some(ShortString::decode(src)?);
        }
        if flags & FLAG_USER_ID != 0 {
            props.user_id = Some(ShortString::decode(src)?);
        }
        if flags & FLAG_APP_ID != 0 {
            props.app_id = Some(ShortString::decode(src)?);
        }
        if flags & FLAG_CLUSTER_ID != 0 {
            props.cluster_id = Some(ShortString::decode(src)?);
        }
        Ok(props)
    }
}

/// A content header frame payload
#[derive(Debug, Clone, PartialEq)]
pub struct ContentHeader {
    /// Content class, `basic` for everything this client sends
    pub class_id: u16,
    /// Total body size in octets across all following BODY frames
    pub body_size: u64,
    /// Message properties
    pub properties: BasicProperties,
}

impl ContentHeader {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        dst.put_u16(self.class_id);
        dst.put_u16(0); // weight, unused
        dst.put_u64(self.body_size);
        self.properties.encode(dst);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        ensure(src, 12)?;
        let class_id = src.get_u16();
        let _weight = src.get_u16();
        let body_size = src.get_u64();
        Ok(Self {
            class_id,
            body_size,
            properties: BasicProperties::decode(src)?,
        })
    }
}
