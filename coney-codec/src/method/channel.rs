//! `channel` class methods (class id 20)

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{get_bits, put_bits};
use crate::types::{ensure, LongString, ShortString};
use crate::Error;

pub(crate) const OPEN: u16 = 10;
pub(crate) const OPEN_OK: u16 = 11;
pub(crate) const FLOW: u16 = 20;
pub(crate) const FLOW_OK: u16 = 21;
pub(crate) const CLOSE: u16 = 40;
pub(crate) const CLOSE_OK: u16 = 41;

/// `channel.open`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Open;

impl Open {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        // reserved out-of-band short string
        ShortString::default().encode(dst);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        let _reserved = ShortString::decode(src)?;
        Ok(Self)
    }
}

/// `channel.open-ok`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpenOk;

impl OpenOk {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        // reserved channel-id long string
        LongString::default().encode(dst);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        let _reserved = LongString::decode(src)?;
        Ok(Self)
    }
}

/// `channel.flow` — pause or resume content delivery
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Flow {
    /// `true` resumes, `false` pauses
    pub active: bool,
}

impl Flow {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        put_bits(dst, &[self.active]);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        let [active] = get_bits(src)?;
        Ok(Self { active })
    }
}

/// `channel.flow-ok`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowOk {
    /// Flow state the peer settled on
    pub active: bool,
}

impl FlowOk {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        put_bits(dst, &[self.active]);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        let [active] = get_bits(src)?;
        Ok(Self { active })
    }
}

/// `channel.close`
#[derive(Debug, Clone, PartialEq)]
pub struct Close {
    /// Reply code explaining the close
    pub reply_code: u16,
    /// Human-readable close reason
    pub reply_text: ShortString,
    /// Class id of the offending method, if any
    pub class_id: u16,
    /// Method id of the offending method, if any
    pub method_id: u16,
}

impl Close {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::tests::roundtrip;
    use crate::method::Method;

    #[test]
    fn open_and_flow_roundtrip() {
        assert_eq!(
            roundtrip(Method::ChannelOpen(Open)),
            Method::ChannelOpen(Open)
        );
        let flow = Method::ChannelFlow(Flow { active: false });
        assert_eq!(roundtrip(flow.clone()), flow);
    }

    #[test]
    fn close_roundtrip() {
        let method = Method::ChannelClose(Close {
            reply_code: 406,
            reply_text: "PRECONDITION_FAILED - durable mismatch".try_into().unwrap(),
            class_id: 50,
            method_id: 10,
        });
        assert_eq!(roundtrip(method.clone()), method);
    }
}
