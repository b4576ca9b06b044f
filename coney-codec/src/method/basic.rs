//! `basic` class methods (class id 60)

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{get_bits, put_bits};
use crate::types::{ensure, FieldTable, ShortString};
use crate::Error;

pub(crate) const QOS: u16 = 10;
pub(crate) const QOS_OK: u16 = 11;
pub(crate) const CONSUME: u16 = 20;
pub(crate) const CONSUME_OK: u16 = 21;
pub(crate) const CANCEL: u16 = 30;
pub(crate) const CANCEL_OK: u16 = 31;
pub(crate) const PUBLISH: u16 = 40;
pub(crate) const RETURN: u16 = 50;
pub(crate) const DELIVER: u16 = 60;
pub(crate) const GET: u16 = 70;
pub(crate) const GET_OK: u16 = 71;
pub(crate) const GET_EMPTY: u16 = 72;
pub(crate) const ACK: u16 = 80;
pub(crate) const REJECT: u16 = 90;
pub(crate) const RECOVER: u16 = 110;
pub(crate) const RECOVER_OK: u16 = 111;
pub(crate) const NACK: u16 = 120;

/// `basic.qos` — bound unacknowledged deliveries
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Qos {
    /// Prefetch window in octets, 0 meaning no limit
    pub prefetch_size: u32,
    /// Prefetch window in messages, 0 meaning no limit
    pub prefetch_count: u16,
    /// Apply per-channel rather than per-consumer
    pub global: bool,
}

impl Qos {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32(self.prefetch_size);
        dst.put_u16(self.prefetch_count);
        put_bits(dst, &[self.global]);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        ensure(src, 6)?;
        Ok(Self {
            prefetch_size: src.get_u32(),
            prefetch_count: src.get_u16(),
            global: get_bits::<1>(src)?[0],
        })
    }
}

/// `basic.consume` — start a consumer
#[derive(Debug, Clone, PartialEq)]
pub struct Consume {
    /// Queue to consume from
    pub queue: ShortString,
    /// Consumer tag; empty asks the server to generate one
    pub consumer_tag: ShortString,
    /// Do not deliver messages published on this connection
    pub no_local: bool,
    /// Server considers messages acknowledged once delivered
    pub no_ack: bool,
    /// Only this consumer may access the queue
    pub exclusive: bool,
    /// Do not wait for consume-ok
    pub no_wait: bool,
    /// Consumer arguments, e.g. priorities
    pub arguments: FieldTable,
}

impl Consume {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        dst.put_u16(0); // reserved ticket
        self.queue.encode(dst);
        self.consumer_tag.encode(dst);
        put_bits(
            dst,
            &[self.no_local, self.no_ack, self.exclusive, self.no_wait],
        );
        self.arguments.encode(dst);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        ensure(src, 2)?;
        let _ticket = src.get_u16();
        let queue = ShortString::decode(src)?;
        let consumer_tag = ShortString::decode(src)?;
        let [no_local, no_ack, exclusive, no_wait] = get_bits(src)?;
        Ok(Self {
            queue,
            consumer_tag,
            no_local,
            no_ack,
            exclusive,
            no_wait,
            arguments: FieldTable::decode(src)?,
        })
    }
}

/// `basic.consume-ok`
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumeOk {
    /// Consumer tag, server-generated when the consume left it empty
    pub consumer_tag: ShortString,
}

impl ConsumeOk {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        self.consumer_tag.encode(dst);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        Ok(Self {
            consumer_tag: ShortString::decode(src)?,
        })
    }
}

/// `basic.cancel` — stop a consumer
///
/// Also sent by the server when a consumed queue is deleted, if the client
/// advertised the `consumer_cancel_notify` capability.
#[derive(Debug, Clone, PartialEq)]
pub struct Cancel {
    /// Consumer tag to cancel
    pub consumer_tag: ShortString,
    /// Do not wait for cancel-ok
    pub no_wait: bool,
}

impl Cancel {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        self.consumer_tag.encode(dst);
        put_bits(dst, &[self.no_wait]);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        Ok(Self {
            consumer_tag: ShortString::decode(src)?,
            no_wait: get_bits::<1>(src)?[0],
        })
    }
}

/// `basic.cancel-ok`
#[derive(Debug, Clone, PartialEq)]
pub struct CancelOk {
    /// Tag of the cancelled consumer
    pub consumer_tag: ShortString,
}

impl CancelOk {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        self.consumer_tag.encode(dst);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        Ok(Self {
            consumer_tag: ShortString::decode(src)?,
        })
    }
}

/// `basic.publish` — carries content
#[derive(Debug, Clone, PartialEq)]
pub struct Publish {
    /// Exchange to publish to; empty means the default exchange
    pub exchange: ShortString,
    /// Routing key
    pub routing_key: ShortString,
    /// Return the message if it cannot be routed to a queue
    pub mandatory: bool,
    /// Return the message if it cannot be delivered immediately
    pub immediate: bool,
}

impl Publish {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        dst.put_u16(0); // reserved ticket
        self.exchange.encode(dst);
        self.routing_key.encode(dst);
        put_bits(dst, &[self.mandatory, self.immediate]);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        ensure(src, 2)?;
        let _ticket = src.get_u16();
        let exchange = ShortString::decode(src)?;
        let routing_key = ShortString::decode(src)?;
        let [mandatory, immediate] = get_bits(src)?;
        Ok(Self {
            exchange,
            routing_key,
            mandatory,
            immediate,
        })
    }
}

/// `basic.return` — an unroutable mandatory message coming back
#[derive(Debug, Clone, PartialEq)]
pub struct Return {
    /// Reply code explaining the return
    pub reply_code: u16,
    /// Human-readable reason
    pub reply_text: ShortString,
    /// Exchange the message was published to
    pub exchange: ShortString,
    /// Routing key the message was published with
    pub routing_key: ShortString,
}

impl Return {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        dst.put_u16(self.reply_code);
        self.reply_text.encode(dst);
        self.exchange.encode(dst);
        self.routing_key.encode(dst);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        ensure(src, 2)?;
        Ok(Self {
            reply_code: src.get_u16(),
            reply_text: ShortString::decode(src)?,
            exchange: ShortString::decode(src)?,
            routing_key: ShortString::decode(src)?,
        })
    }
}

/// `basic.deliver` — a message pushed to a consumer
#[derive(Debug, Clone, PartialEq)]
pub struct Deliver {
    /// Tag of the consumer the message is for
    pub consumer_tag: ShortString,
    /// Server-assigned delivery tag, valid on this channel
    pub delivery_tag: u64,
    /// Message has been delivered before
    pub redelivered: bool,
    /// Exchange the message was published to
    pub exchange: ShortString,
    /// Routing key the message was published with
    pub routing_key: ShortString,
}

impl Deliver {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        self.consumer_tag.encode(dst);
        dst.put_u64(self.delivery_tag);
        put_bits(dst, &[self.redelivered]);
        self.exchange.encode(dst);
        self.routing_key.encode(dst);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        let consumer_tag = ShortString::decode(src)?;
        ensure(src, 8)?;
        let delivery_tag = src.get_u64();
        let [redelivered] = get_bits(src)?;
        Ok(Self {
            consumer_tag,
            delivery_tag,
            redelivered,
            exchange: ShortString::decode(src)?,
            routing_key: ShortString::decode(src)?,
        })
    }
}

/// `basic.get` — synchronously fetch a single message
#[derive(Debug, Clone, PartialEq)]
pub struct Get {
    /// Queue to fetch from
    pub queue: ShortString,
    /// Server considers the message acknowledged once sent
    pub no_ack: bool,
}

impl Get {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        dst.put_u16(0);
        self.queue.encode(dst);
        put_bits(dst, &[self.no_ack]);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        ensure(src, 2)?;
        let _ticket = src.get_u16();
        Ok(Self {
            queue: ShortString::decode(src)?,
            no_ack: get_bits::<1>(src)?[0],
        })
    }
}

/// `basic.get-ok` — carries content
#[derive(Debug, Clone, PartialEq)]
pub struct GetOk {
    /// Server-assigned delivery tag
    pub delivery_tag: u64,
    /// Message has been delivered before
    pub redelivered: bool,
    /// Exchange the message was published to
    pub exchange: ShortString,
    /// Routing key the message was published with
    pub routing_key: ShortString,
    /// Messages remaining in the queue
    pub message_count: u32,
}

impl GetOk {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        dst.put_u64(self.delivery_tag);
        put_bits(dst, &[self.redelivered]);
        self.exchange.encode(dst);
        self.routing_key.encode(dst);
        dst.put_u32(self.message_count);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        ensure(src, 8)?;
        let delivery_tag = src.get_u64();
        let [redelivered] = get_bits(src)?;
        let exchange = ShortString::decode(src)?;
        let routing_key = ShortString::decode(src)?;
        ensure(src, 4)?;
        Ok(Self {
            delivery_tag,
            redelivered,
            exchange,
            routing_key,
            message_count: src.get_u32(),
        })
    }
}

/// `basic.ack` — sent by either peer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ack {
    /// Delivery tag (consumer side) or publish sequence (confirm mode)
    pub delivery_tag: u64,
    /// Acknowledge all outstanding tags up to and including this one
    pub multiple: bool,
}

impl Ack {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        dst.put_u64(self.delivery_tag);
        put_bits(dst, &[self.multiple]);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        ensure(src, 8)?;
        Ok(Self {
            delivery_tag: src.get_u64(),
            multiple: get_bits::<1>(src)?[0],
        })
    }
}

/// `basic.reject` — refuse a single delivery
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reject {
    /// Delivery tag to reject
    pub delivery_tag: u64,
    /// Requeue rather than discard/dead-letter
    pub requeue: bool,
}

impl Reject {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        dst.put_u64(self.delivery_tag);
        put_bits(dst, &[self.requeue]);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        ensure(src, 8)?;
        Ok(Self {
            delivery_tag: src.get_u64(),
            requeue: get_bits::<1>(src)?[0],
        })
    }
}

/// `basic.recover` — redeliver unacknowledged messages
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Recover {
    /// Requeue (possibly to other consumers) rather than redeliver here
    pub requeue: bool,
}

impl Recover {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        put_bits(dst, &[self.requeue]);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        Ok(Self {
            requeue: get_bits::<1>(src)?[0],
        })
    }
}

/// `basic.nack` — negative acknowledgement, single or cumulative
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Nack {
    /// Delivery tag (consumer side) or publish sequence (confirm mode)
    pub delivery_tag: u64,
    /// Reject all outstanding tags up to and including this one
    pub multiple: bool,
    /// Requeue rather than discard/dead-letter
    pub requeue: bool,
}

impl Nack {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        dst.put_u64(self.delivery_tag);
        put_bits(dst, &[self.multiple, self.requeue]);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        ensure(src, 8)?;
        let delivery_tag = src.get_u64();
        let [multiple, requeue] = get_bits(src)?;
        Ok(Self {
            delivery_tag,
            multiple,
            requeue,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::tests::roundtrip;
    use crate::method::Method;

    #[test]
    fn publish_roundtrip() {
        let method = Method::BasicPublish(Publish {
            exchange: "".try_into().unwrap(),
            routing_key: "tasks".try_into().unwrap(),
            mandatory: true,
            immediate: false,
        });
        assert_eq!(roundtrip(method.clone()), method);
    }

    #[test]
    fn deliver_roundtrip() {
        let method = Method::BasicDeliver(Deliver {
            consumer_tag: "ctag-1".try_into().unwrap(),
            delivery_tag: 42,
            redelivered: true,
            exchange: "logs".try_into().unwrap(),
            routing_key: "info".try_into().unwrap(),
        });
        assert_eq!(roundtrip(method.clone()), method);
        assert!(method.carries_content());
    }

    #[test]
    fn ack_and_nack_roundtrip() {
        let ack = Method::BasicAck(Ack {
            delivery_tag: 7,
            multiple: true,
        });
        assert_eq!(roundtrip(ack.clone()), ack);

        let nack = Method::BasicNack(Nack {
            delivery_tag: 8,
            multiple: false,
            requeue: true,
        });
        assert_eq!(roundtrip(nack.clone()), nack);
    }

    #[test]
    fn consume_bits() {
        let method = Method::BasicConsume(Consume {
            queue: "q".try_into().unwrap(),
            consumer_tag: "".try_into().unwrap(),
            no_local: false,
            no_ack: true,
            exclusive: false,
            no_wait: false,
            arguments: FieldTable::new(),
        });
        assert_eq!(roundtrip(method.clone()), method);
    }

    #[test]
    fn qos_roundtrip() {
        let method = Method::BasicQos(Qos {
            prefetch_size: 0,
            prefetch_count: 64,
            global: false,
        });
        assert_eq!(roundtrip(method.clone()), method);
    }
}
