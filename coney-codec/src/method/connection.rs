//! `connection` class methods (class id 10)

use bytes::{Buf, Bytes, BytesMut};

use super::{get_bits, put_bits};
use crate::types::{ensure, FieldTable, LongString, ShortString};
use crate::Error;

pub(crate) const START: u16 = 10;
pub(crate) const START_OK: u16 = 11;
pub(crate) const SECURE: u16 = 20;
pub(crate) const SECURE_OK: u16 = 21;
pub(crate) const TUNE: u16 = 30;
pub(crate) const TUNE_OK: u16 = 31;
pub(crate) const OPEN: u16 = 40;
pub(crate) const OPEN_OK: u16 = 41;
pub(crate) const CLOSE: u16 = 50;
pub(crate) const CLOSE_OK: u16 = 51;
pub(crate) const BLOCKED: u16 = 60;
pub(crate) const UNBLOCKED: u16 = 61;

/// `connection.start` — opens protocol negotiation
#[derive(Debug, Clone, PartialEq)]
pub struct Start {
    /// Protocol major version
    pub version_major: u8,
    /// Protocol minor version
    pub version_minor: u8,
    /// Server capabilities and product information
    pub server_properties: FieldTable,
    /// Space-separated list of SASL mechanisms the server supports
    pub mechanisms: LongString,
    /// Space-separated list of locales the server supports
    pub locales: LongString,
}

impl Start {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        dst.extend_from_slice(&[self.version_major, self.version_minor]);
        self.server_properties.encode(dst);
        self.mechanisms.encode(dst);
        self.locales.encode(dst);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        ensure(src, 2)?;
        Ok(Self {
            version_major: src.get_u8(),
            version_minor: src.get_u8(),
            server_properties: FieldTable::decode(src)?,
            mechanisms: LongString::decode(src)?,
            locales: LongString::decode(src)?,
        })
    }
}

/// `connection.start-ok` — client identity and selected mechanism
#[derive(Debug, Clone, PartialEq)]
pub struct StartOk {
    /// Client product information sent to the server
    pub client_properties: FieldTable,
    /// Selected SASL mechanism
    pub mechanism: ShortString,
    /// Initial SASL response
    pub response: LongString,
    /// Selected locale
    pub locale: ShortString,
}

impl StartOk {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        self.client_properties.encode(dst);
        self.mechanism.encode(dst);
        self.response.encode(dst);
        self.locale.encode(dst);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        Ok(Self {
            client_properties: FieldTable::decode(src)?,
            mechanism: ShortString::decode(src)?,
            response: LongString::decode(src)?,
            locale: ShortString::decode(src)?,
        })
    }
}

/// `connection.secure` — SASL challenge
#[derive(Debug, Clone, PartialEq)]
pub struct Secure {
    /// Opaque challenge data
    pub challenge: LongString,
}

impl Secure {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        self.challenge.encode(dst);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        Ok(Self {
            challenge: LongString::decode(src)?,
        })
    }
}

/// `connection.secure-ok` — SASL challenge response
#[derive(Debug, Clone, PartialEq)]
pub struct SecureOk {
    /// Opaque response data
    pub response: LongString,
}

impl SecureOk {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        self.response.encode(dst);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        Ok(Self {
            response: LongString::decode(src)?,
        })
    }
}

/// `connection.tune` — server-proposed limits
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tune {
    /// Highest channel number the server accepts, 0 meaning no limit
    pub channel_max: u16,
    /// Largest frame the server accepts, 0 meaning no limit
    pub frame_max: u32,
    /// Heartbeat interval the server wants, in seconds, 0 disabling it
    pub heartbeat: u16,
}

impl Tune {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        use bytes::BufMut;
        dst.put_u16(self.channel_max);
        dst.put_u32(self.frame_max);
        dst.put_u16(self.heartbeat);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        ensure(src, 8)?;
        Ok(Self {
            channel_max: src.get_u16(),
            frame_max: src.get_u32(),
            heartbeat: src.get_u16(),
        })
    }
}

/// `connection.tune-ok` — negotiated limits the client commits to
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TuneOk {
    /// Negotiated channel-max
    pub channel_max: u16,
    /// Negotiated frame-max
    pub frame_max: u32,
    /// Negotiated heartbeat interval in seconds
    pub heartbeat: u16,
}

impl TuneOk {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        use bytes::BufMut;
        dst.put_u16(self.channel_max);
        dst.put_u32(self.frame_max);
        dst.put_u16(self.heartbeat);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        ensure(src, 8)?;
        Ok(Self {
            channel_max: src.get_u16(),
            frame_max: src.get_u32(),
            heartbeat: src.get_u16(),
        })
    }
}

/// `connection.open` — selects the virtual host
#[derive(Debug, Clone, PartialEq)]
pub struct Open {
    /// Virtual host to open
    pub virtual_host: ShortString,
}

impl Open {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        self.virtual_host.encode(dst);
        // reserved: capabilities short string and insist bit
        ShortString::default().encode(dst);
        put_bits(dst, &[false]);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        let virtual_host = ShortString::decode(src)?;
        let _capabilities = ShortString::decode(src)?;
        let [_insist] = get_bits(src)?;
        Ok(Self { virtual_host })
    }
}

/// `connection.open-ok`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpenOk {
    /// Reserved known-hosts field
    pub known_hosts: ShortString,
}

impl OpenOk {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        self.known_hosts.encode(dst);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        Ok(Self {
            known_hosts: ShortString::decode(src)?,
        })
    }
}

/// `connection.close` — orderly or error-driven shutdown
#[derive(Debug, Clone, PartialEq)]
pub struct Close {
    /// Reply code explaining the close
    pub reply_code: u16,
    /// Human-readable close reason
    pub reply_text: ShortString,
    /// Class id of the method that caused the close, if any
    pub class_id: u16,
    /// Method id of the method that caused the close, if any
    pub method_id: u16,
}

impl Close {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        use bytes::BufMut;
        dst.put_u16(self.reply_code);
        self.reply_text.encode(dst);
        dst.put_u16(self.class_id);
        dst.put_u16(self.method_id);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        ensure(src, 2)?;
        let reply_code = src.get_u16();
        let reply_text = ShortString::decode(src)?;
        ensure(src, 4)?;
        Ok(Self {
            reply_code,
            reply_text,
            class_id: src.get_u16(),
            method_id: src.get_u16(),
        })
    }
}

/// `connection.blocked` — the server stopped accepting publishes
#[derive(Debug, Clone, PartialEq)]
pub struct Blocked {
    /// Reason the server reported, typically a resource alarm
    pub reason: ShortString,
}

impl Blocked {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        self.reason.encode(dst);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        Ok(Self {
            reason: ShortString::decode(src)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::tests::roundtrip;
    use crate::method::Method;
    use crate::types::FieldValue;

    #[test]
    fn start_roundtrip() {
        let mut props = FieldTable::new();
        props.insert(
            "version".try_into().unwrap(),
            FieldValue::LongString("3.13.0".into()),
        );
        let method = Method::ConnectionStart(Start {
            version_major: 0,
            version_minor: 9,
            server_properties: props,
            mechanisms: "PLAIN AMQPLAIN".into(),
            locales: "en_US".into(),
        });
        assert_eq!(roundtrip(method.clone()), method);
    }

    #[test]
    fn tune_roundtrip() {
        let method = Method::ConnectionTune(Tune {
            channel_max: 2047,
            frame_max: 131072,
            heartbeat: 60,
        });
        assert_eq!(roundtrip(method.clone()), method);
    }

    #[test]
    fn open_encodes_reserved_fields() {
        let method = Method::ConnectionOpen(Open {
            virtual_host: "/".try_into().unwrap(),
        });
        let mut buf = BytesMut::new();
        method.encode(&mut buf);
        // class 10, method 40, "/" vhost, empty capabilities, no insist
        assert_eq!(&buf[..], &[0, 10, 0, 40, 1, b'/', 0, 0]);
    }

    #[test]
    fn close_roundtrip() {
        let method = Method::ConnectionClose(Close {
            reply_code: 320,
            reply_text: "CONNECTION_FORCED - shutdown".try_into().unwrap(),
            class_id: 0,
            method_id: 0,
        });
        assert_eq!(roundtrip(method.clone()), method);
    }
}
