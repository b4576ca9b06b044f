//! `queue` class methods (class id 50)

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{get_bits, put_bits};
use crate::types::{ensure, FieldTable, ShortString};
use crate::Error;

pub(crate) const DECLARE: u16 = 10;
pub(crate) const DECLARE_OK: u16 = 11;
pub(crate) const BIND: u16 = 20;
pub(crate) const BIND_OK: u16 = 21;
pub(crate) const PURGE: u16 = 30;
pub(crate) const PURGE_OK: u16 = 31;
pub(crate) const DELETE: u16 = 40;
pub(crate) const DELETE_OK: u16 = 41;
pub(crate) const UNBIND: u16 = 50;
pub(crate) const UNBIND_OK: u16 = 51;

/// `queue.declare`
#[derive(Debug, Clone, PartialEq)]
pub struct Declare {
    /// Queue name; empty asks the server to generate one
    pub queue: ShortString,
    /// Assert existence without creating
    pub passive: bool,
    /// Survive a broker restart
    pub durable: bool,
    /// Restrict to this connection and delete with it
    pub exclusive: bool,
    /// Delete when the last consumer cancels
    pub auto_delete: bool,
    /// Do not wait for declare-ok
    pub no_wait: bool,
    /// Implementation-specific arguments, e.g. TTLs and limits
    pub arguments: FieldTable,
}

impl Declare {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        dst.put_u16(0); // reserved ticket
        self.queue.encode(dst);
        put_bits(
            dst,
            &[
                self.passive,
                self.durable,
                self.exclusive,
                self.auto_delete,
                self.no_wait,
            ],
        );
        self.arguments.encode(dst);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        ensure(src, 2)?;
        let _ticket = src.get_u16();
        let queue = ShortString::decode(src)?;
        let [passive, durable, exclusive, auto_delete, no_wait] = get_bits(src)?;
        Ok(Self {
            queue,
            passive,
            durable,
            exclusive,
            auto_delete,
            no_wait,
            arguments: FieldTable::decode(src)?,
        })
    }
}

/// `queue.declare-ok`
#[derive(Debug, Clone, PartialEq)]
pub struct DeclareOk {
    /// Queue name, server-generated when the declare left it empty
    pub queue: ShortString,
    /// Number of messages currently in the queue
    pub message_count: u32,
    /// Number of active consumers
    pub consumer_count: u32,
}

impl DeclareOk {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        self.queue.encode(dst);
        dst.put_u32(self.message_count);
        dst.put_u32(self.consumer_count);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        let queue = ShortString::decode(src)?;
        ensure(src, 8)?;
        Ok(Self {
            queue,
            message_count: src.get_u32(),
            consumer_count: src.get_u32(),
        })
    }
}

/// `queue.bind`
#[derive(Debug, Clone, PartialEq)]
pub struct Bind {
    /// Queue to bind
    pub queue: ShortString,
    /// Exchange to bind to
    pub exchange: ShortString,
    /// Routing key for the binding
    pub routing_key: ShortString,
    /// Do not wait for bind-ok
    pub no_wait: bool,
    /// Binding arguments
    pub arguments: FieldTable,
}

impl Bind {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        dst.put_u16(0);
        self.queue.encode(dst);
        self.exchange.encode(dst);
        self.routing_key.encode(dst);
        put_bits(dst, &[self.no_wait]);
        self.arguments.encode(dst);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        ensure(src, 2)?;
        let _ticket = src.get_u16();
        Ok(Self {
            queue: ShortString::decode(src)?,
            exchange: ShortString::decode(src)?,
            routing_key: ShortString::decode(src)?,
            no_wait: get_bits::<1>(src)?[0],
            arguments: FieldTable::decode(src)?,
        })
    }
}

/// `queue.unbind` — carries no no-wait bit, unlike bind
#[derive(Debug, Clone, PartialEq)]
pub struct Unbind {
    /// Queue to unbind
    pub queue: ShortString,
    /// Exchange to unbind from
    pub exchange: ShortString,
    /// Routing key of the binding to remove
    pub routing_key: ShortString,
    /// Arguments of the binding to remove
    pub arguments: FieldTable,
}

impl Unbind {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        dst.put_u16(0);
        self.queue.encode(dst);
        self.exchange.encode(dst);
        self.routing_key.encode(dst);
        self.arguments.encode(dst);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        ensure(src, 2)?;
        let _ticket = src.get_u16();
        Ok(Self {
            queue: ShortString::decode(src)?,
            exchange: ShortString::decode(src)?,
            routing_key: ShortString::decode(src)?,
            arguments: FieldTable::decode(src)?,
        })
    }
}

/// `queue.purge`
#[derive(Debug, Clone, PartialEq)]
pub struct Purge {
    /// Queue to purge
    pub queue: ShortString,
    /// Do not wait for purge-ok
    pub no_wait: bool,
}

impl Purge {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        dst.put_u16(0);
        self.queue.encode(dst);
        put_bits(dst, &[self.no_wait]);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        ensure(src, 2)?;
        let _ticket = src.get_u16();
        Ok(Self {
            queue: ShortString::decode(src)?,
            no_wait: get_bits::<1>(src)?[0],
        })
    }
}

/// `queue.purge-ok`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PurgeOk {
    /// Number of messages discarded
    pub message_count: u32,
}

impl PurgeOk {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32(self.message_count);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        ensure(src, 4)?;
        Ok(Self {
            message_count: src.get_u32(),
        })
    }
}

/// `queue.delete`
#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    /// Queue to delete
    pub queue: ShortString,
    /// Only delete if the queue has no consumers
    pub if_unused: bool,
    /// Only delete if the queue is empty
    pub if_empty: bool,
    /// Do not wait for delete-ok
    pub no_wait: bool,
}

impl Delete {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        dst.put_u16(0);
        self.queue.encode(dst);
        put_bits(dst, &[self.if_unused, self.if_empty, self.no_wait]);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        ensure(src, 2)?;
        let _ticket = src.get_u16();
        let queue = ShortString::decode(src)?;
        let [if_unused, if_empty, no_wait] = get_bits(src)?;
        Ok(Self {
            queue,
            if_unused,
            if_empty,
            no_wait,
        })
    }
}

/// `queue.delete-ok`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeleteOk {
    /// Number of messages deleted along with the queue
    pub message_count: u32,
}

impl DeleteOk {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32(self.message_count);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        ensure(src, 4)?;
        Ok(Self {
            message_count: src.get_u32(),
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
    fn declare_roundtrip_with_arguments() {
        let mut arguments = FieldTable::new();
        arguments.insert("x-max-length".try_into().unwrap(), FieldValue::I32(1000));
        let method = Method::QueueDeclare(Declare {
            queue: "tasks".try_into().unwrap(),
            passive: false,
            durable: true,
            exclusive: false,
            auto_delete: false,
            no_wait: false,
            arguments,
        });
        assert_eq!(roundtrip(method.clone()), method);
    }

    #[test]
    fn declare_ok_roundtrip() {
        let method = Method::QueueDeclareOk(DeclareOk {
            queue: "amq.gen-JzTY20BRgKO-HjmUJj0wLg".try_into().unwrap(),
            message_count: 12,
            consumer_count: 1,
        });
        assert_eq!(roundtrip(method.clone()), method);
    }

    #[test]
    fn unbind_has_no_nowait_bit() {
        let method = Method::QueueUnbind(Unbind {
            queue: "q".try_into().unwrap(),
            exchange: "e".try_into().unwrap(),
            routing_key: "k".try_into().unwrap(),
            arguments: FieldTable::new(),
        });
        let mut buf = BytesMut::new();
        method.encode(&mut buf);
        // 4 id bytes + 2 ticket + 3 short strings (2 bytes each) + 4 table len
        assert_eq!(buf.len(), 4 + 2 + 2 + 2 + 2 + 4);
        assert_eq!(roundtrip(method.clone()), method);
    }

    #[test]
    fn delete_bits() {
        let method = Method::QueueDelete(Delete {
            queue: "q".try_into().unwrap(),
            if_unused: true,
            if_empty: true,
            no_wait: false,
        });
        assert_eq!(roundtrip(method.clone()), method);
    }
}
