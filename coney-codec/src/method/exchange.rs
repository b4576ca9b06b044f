//! `exchange` class methods (class id 40)

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{get_bits, put_bits};
use crate::types::{ensure, FieldTable, ShortString};
use crate::Error;

pub(crate) const DECLARE: u16 = 10;
pub(crate) const DECLARE_OK: u16 = 11;
pub(crate) const DELETE: u16 = 20;
pub(crate) const DELETE_OK: u16 = 21;
pub(crate) const BIND: u16 = 30;
pub(crate) const BIND_OK: u16 = 31;
pub(crate) const UNBIND: u16 = 40;
// unbind-ok is 51, not 41, per the published XML
pub(crate) const UNBIND_OK: u16 = 51;

/// `exchange.declare`
#[derive(Debug, Clone, PartialEq)]
pub struct Declare {
    /// Exchange name
    pub exchange: ShortString,
    /// Exchange type, e.g. `direct`, `fanout`, `topic`, `headers`
    pub kind: ShortString,
    /// Assert existence without creating
    pub passive: bool,
    /// Survive a broker restart
    pub durable: bool,
    /// Delete when no longer used
    pub auto_delete: bool,
    /// Only reachable through exchange-to-exchange bindings
    pub internal: bool,
    /// Do not wait for declare-ok
    pub no_wait: bool,
    /// Implementation-specific arguments
    pub arguments: FieldTable,
}

impl Declare {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        dst.put_u16(0); // reserved ticket
        self.exchange.encode(dst);
        self.kind.encode(dst);
        put_bits(
            dst,
            &[
                self.passive,
                self.durable,
                self.auto_delete,
                self.internal,
                self.no_wait,
            ],
        );
        self.arguments.encode(dst);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        ensure(src, 2)?;
        let _ticket = src.get_u16();
        let exchange = ShortString::decode(src)?;
        let kind = ShortString::decode(src)?;
        let [passive, durable, auto_delete, internal, no_wait] = get_bits(src)?;
        Ok(Self {
            exchange,
            kind,
            passive,
            durable,
            auto_delete,
            internal,
            no_wait,
            arguments: FieldTable::decode(src)?,
        })
    }
}

/// `exchange.delete`
#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    /// Exchange name
    pub exchange: ShortString,
    /// Only delete if the exchange has no bindings
    pub if_unused: bool,
    /// Do not wait for delete-ok
    pub no_wait: bool,
}

impl Delete {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        dst.put_u16(0);
        self.exchange.encode(dst);
        put_bits(dst, &[self.if_unused, self.no_wait]);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        ensure(src, 2)?;
        let _ticket = src.get_u16();
        let exchange = ShortString::decode(src)?;
        let [if_unused, no_wait] = get_bits(src)?;
        Ok(Self {
            exchange,
            if_unused,
            no_wait,
        })
    }
}

/// `exchange.bind` — exchange-to-exchange binding
#[derive(Debug, Clone, PartialEq)]
pub struct Bind {
    /// Exchange receiving routed messages
    pub destination: ShortString,
    /// Exchange messages are routed from
    pub source: ShortString,
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
        self.destination.encode(dst);
        self.source.encode(dst);
        self.routing_key.encode(dst);
        put_bits(dst, &[self.no_wait]);
        self.arguments.encode(dst);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        ensure(src, 2)?;
        let _ticket = src.get_u16();
        Ok(Self {
            destination: ShortString::decode(src)?,
            source: ShortString::decode(src)?,
            routing_key: ShortString::decode(src)?,
            no_wait: get_bits::<1>(src)?[0],
            arguments: FieldTable::decode(src)?,
        })
    }
}

/// `exchange.unbind`
#[derive(Debug, Clone, PartialEq)]
pub struct Unbind {
    /// Exchange the binding routes to
    pub destination: ShortString,
    /// Exchange the binding routes from
    pub source: ShortString,
    /// Routing key of the binding to remove
    pub routing_key: ShortString,
    /// Do not wait for unbind-ok
    pub no_wait: bool,
    /// Arguments of the binding to remove
    pub arguments: FieldTable,
}

impl Unbind {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        dst.put_u16(0);
        self.destination.encode(dst);
        self.source.encode(dst);
        self.routing_key.encode(dst);
        put_bits(dst, &[self.no_wait]);
        self.arguments.encode(dst);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        ensure(src, 2)?;
        let _ticket = src.get_u16();
        Ok(Self {
            destination: ShortString::decode(src)?,
            source: ShortString::decode(src)?,
            routing_key: ShortString::decode(src)?,
            no_wait: get_bits::<1>(src)?[0],
            arguments: FieldTable::decode(src)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::tests::roundtrip;
    use crate::method::Method;

    #[test]
    fn declare_bit_packing() {
        let method = Method::ExchangeDeclare(Declare {
            exchange: "logs".try_into().unwrap(),
            kind: "topic".try_into().unwrap(),
            passive: false,
            durable: true,
            auto_delete: false,
            internal: false,
            no_wait: false,
            arguments: FieldTable::new(),
        });
        let mut buf = BytesMut::new();
        method.encode(&mut buf);
        // bits byte: durable only => 0b0000_0010
        let bits = buf[4 + 2 + 5 + 6];
        assert_eq!(bits, 0b0000_0010);
        assert_eq!(roundtrip(method.clone()), method);
    }

    #[test]
    fn bind_roundtrip() {
        let method = Method::ExchangeBind(Bind {
            destination: "dest".try_into().unwrap(),
            source: "src".try_into().unwrap(),
            routing_key: "#".try_into().unwrap(),
            no_wait: false,
            arguments: FieldTable::new(),
        });
        assert_eq!(roundtrip(method.clone()), method);
    }
}
