//! Method frames: class/method ids and positionally packed arguments
//!
//! Each class lives in its own module; [`Method`] is the tagged union the
//! dispatcher routes on. Decoding an unknown (class, method) pair fails with
//! [`Error::UnknownMethod`] so the connection can be terminated with
//! COMMAND_INVALID rather than silently skipping bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::types::ensure;
use crate::Error;

pub mod basic;
pub mod channel;
pub mod confirm;
pub mod connection;
pub mod exchange;
pub mod queue;

/// Class id of the `connection` class
pub const CLASS_CONNECTION: u16 = 10;
/// Class id of the `channel` class
pub const CLASS_CHANNEL: u16 = 20;
/// Class id of the `exchange` class
pub const CLASS_EXCHANGE: u16 = 40;
/// Class id of the `queue` class
pub const CLASS_QUEUE: u16 = 50;
/// Class id of the `basic` class
pub const CLASS_BASIC: u16 = 60;
/// Class id of the `confirm` class
pub const CLASS_CONFIRM: u16 = 85;

/// A decoded AMQP 0-9-1 method
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)] // variant names mirror the spec method names
pub enum Method {
    ConnectionStart(connection::Start),
    ConnectionStartOk(connection::StartOk),
    ConnectionSecure(connection::Secure),
    ConnectionSecureOk(connection::SecureOk),
    ConnectionTune(connection::Tune),
    ConnectionTuneOk(connection::TuneOk),
    ConnectionOpen(connection::Open),
    ConnectionOpenOk(connection::OpenOk),
    ConnectionClose(connection::Close),
    ConnectionCloseOk,
    ConnectionBlocked(connection::Blocked),
    ConnectionUnblocked,

    ChannelOpen(channel::Open),
    ChannelOpenOk(channel::OpenOk),
    ChannelFlow(channel::Flow),
    ChannelFlowOk(channel::FlowOk),
    ChannelClose(channel::Close),
    ChannelCloseOk,

    ExchangeDeclare(exchange::Declare),
    ExchangeDeclareOk,
    ExchangeDelete(exchange::Delete),
    ExchangeDeleteOk,
    ExchangeBind(exchange::Bind),
    ExchangeBindOk,
    ExchangeUnbind(exchange::Unbind),
    ExchangeUnbindOk,

    QueueDeclare(queue::Declare),
    QueueDeclareOk(queue::DeclareOk),
    QueueBind(queue::Bind),
    QueueBindOk,
    QueueUnbind(queue::Unbind),
    QueueUnbindOk,
    QueuePurge(queue::Purge),
    QueuePurgeOk(queue::PurgeOk),
    QueueDelete(queue::Delete),
    QueueDeleteOk(queue::DeleteOk),

    BasicQos(basic::Qos),
    BasicQosOk,
    BasicConsume(basic::Consume),
    BasicConsumeOk(basic::ConsumeOk),
    BasicCancel(basic::Cancel),
    BasicCancelOk(basic::CancelOk),
    BasicPublish(basic::Publish),
    BasicReturn(basic::Return),
    BasicDeliver(basic::Deliver),
    BasicGet(basic::Get),
    BasicGetOk(basic::GetOk),
    BasicGetEmpty,
    BasicAck(basic::Ack),
    BasicReject(basic::Reject),
    BasicRecover(basic::Recover),
    BasicRecoverOk,
    BasicNack(basic::Nack),

    ConfirmSelect(confirm::Select),
    ConfirmSelectOk,
}

impl Method {
    /// Class id of the method
    pub fn class_id(&self) -> u16 {
        use Method::*;
        match self {
            ConnectionStart(_) | ConnectionStartOk(_) | ConnectionSecure(_)
            | ConnectionSecureOk(_) | ConnectionTune(_) | ConnectionTuneOk(_)
            | ConnectionOpen(_) | ConnectionOpenOk(_) | ConnectionClose(_) | ConnectionCloseOk
            | ConnectionBlocked(_) | ConnectionUnblocked => CLASS_CONNECTION,
            ChannelOpen(_) | ChannelOpenOk(_) | ChannelFlow(_) | ChannelFlowOk(_)
            | ChannelClose(_) | ChannelCloseOk => CLASS_CHANNEL,
            ExchangeDeclare(_) | ExchangeDeclareOk | ExchangeDelete(_) | ExchangeDeleteOk
            | ExchangeBind(_) | ExchangeBindOk | ExchangeUnbind(_) | ExchangeUnbindOk => {
                CLASS_EXCHANGE
            }
            QueueDeclare(_) | QueueDeclareOk(_) | QueueBind(_) | QueueBindOk | QueueUnbind(_)
            | QueueUnbindOk | QueuePurge(_) | QueuePurgeOk(_) | QueueDelete(_)
            | QueueDeleteOk(_) => CLASS_QUEUE,
            BasicQos(_) | BasicQosOk | BasicConsume(_) | BasicConsumeOk(_) | BasicCancel(_)
            | BasicCancelOk(_) | BasicPublish(_) | BasicReturn(_) | BasicDeliver(_)
            | BasicGet(_) | BasicGetOk(_) | BasicGetEmpty | BasicAck(_) | BasicReject(_)
            | BasicRecover(_) | BasicRecoverOk | BasicNack(_) => CLASS_BASIC,
            ConfirmSelect(_) | ConfirmSelectOk => CLASS_CONFIRM,
        }
    }

    /// Method id within the class
    pub fn method_id(&self) -> u16 {
        use Method::*;
        match self {
            ConnectionStart(_) => connection::START,
            ConnectionStartOk(_) => connection::START_OK,
            ConnectionSecure(_) => connection::SECURE,
            ConnectionSecureOk(_) => connection::SECURE_OK,
            ConnectionTune(_) => connection::TUNE,
            ConnectionTuneOk(_) => connection::TUNE_OK,
            ConnectionOpen(_) => connection::OPEN,
            ConnectionOpenOk(_) => connection::OPEN_OK,
            ConnectionClose(_) => connection::CLOSE,
            ConnectionCloseOk => connection::CLOSE_OK,
            ConnectionBlocked(_) => connection::BLOCKED,
            ConnectionUnblocked => connection::UNBLOCKED,

            ChannelOpen(_) => channel::OPEN,
            ChannelOpenOk(_) => channel::OPEN_OK,
            ChannelFlow(_) => channel::FLOW,
            ChannelFlowOk(_) => channel::FLOW_OK,
            ChannelClose(_) => channel::CLOSE,
            ChannelCloseOk => channel::CLOSE_OK,

            ExchangeDeclare(_) => exchange::DECLARE,
            ExchangeDeclareOk => exchange::DECLARE_OK,
            ExchangeDelete(_) => exchange::DELETE,
            ExchangeDeleteOk => exchange::DELETE_OK,
            ExchangeBind(_) => exchange::BIND,
            ExchangeBindOk => exchange::BIND_OK,
            ExchangeUnbind(_) => exchange::UNBIND,
            ExchangeUnbindOk => exchange::UNBIND_OK,

            QueueDeclare(_) => queue::DECLARE,
            QueueDeclareOk(_) => queue::DECLARE_OK,
            QueueBind(_) => queue::BIND,
            QueueBindOk => queue::BIND_OK,
            QueueUnbind(_) => queue::UNBIND,
            QueueUnbindOk => queue::UNBIND_OK,
            QueuePurge(_) => queue::PURGE,
            QueuePurgeOk(_) => queue::PURGE_OK,
            QueueDelete(_) => queue::DELETE,
            QueueDeleteOk(_) => queue::DELETE_OK,

            BasicQos(_) => basic::QOS,
            BasicQosOk => basic::QOS_OK,
            BasicConsume(_) => basic::CONSUME,
            BasicConsumeOk(_) => basic::CONSUME_OK,
            BasicCancel(_) => basic::CANCEL,
            BasicCancelOk(_) => basic::CANCEL_OK,
            BasicPublish(_) => basic::PUBLISH,
            BasicReturn(_) => basic::RETURN,
            BasicDeliver(_) => basic::DELIVER,
            BasicGet(_) => basic::GET,
            BasicGetOk(_) => basic::GET_OK,
            BasicGetEmpty => basic::GET_EMPTY,
            BasicAck(_) => basic::ACK,
            BasicReject(_) => basic::REJECT,
            BasicRecover(_) => basic::RECOVER,
            BasicRecoverOk => basic::RECOVER_OK,
            BasicNack(_) => basic::NACK,

            ConfirmSelect(_) => confirm::SELECT,
            ConfirmSelectOk => confirm::SELECT_OK,
        }
    }

    /// Whether the method announces a content header and body to follow
    pub fn carries_content(&self) -> bool {
        matches!(
            self,
            Method::BasicPublish(_)
                | Method::BasicReturn(_)
                | Method::BasicDeliver(_)
                | Method::BasicGetOk(_)
        )
    }

    /// Encodes class id, method id, and arguments into `dst`
    pub fn encode(&self, dst: &mut BytesMut) {
        use Method::*;

        dst.put_u16(self.class_id());
        dst.put_u16(self.method_id());
        match self {
            ConnectionStart(m) => m.encode(dst),
            ConnectionStartOk(m) => m.encode(dst),
            ConnectionSecure(m) => m.encode(dst),
            ConnectionSecureOk(m) => m.encode(dst),
            ConnectionTune(m) => m.encode(dst),
            ConnectionTuneOk(m) => m.encode(dst),
            ConnectionOpen(m) => m.encode(dst),
            ConnectionOpenOk(m) => m.encode(dst),
            ConnectionClose(m) => m.encode(dst),
            ConnectionBlocked(m) => m.encode(dst),

            ChannelOpen(m) => m.encode(dst),
            ChannelOpenOk(m) => m.encode(dst),
            ChannelFlow(m) => m.encode(dst),
            ChannelFlowOk(m) => m.encode(dst),
            ChannelClose(m) => m.encode(dst),

            ExchangeDeclare(m) => m.encode(dst),
            ExchangeDelete(m) => m.encode(dst),
            ExchangeBind(m) => m.encode(dst),
            ExchangeUnbind(m) => m.encode(dst),

            QueueDeclare(m) => m.encode(dst),
            QueueDeclareOk(m) => m.encode(dst),
            QueueBind(m) => m.encode(dst),
            QueueUnbind(m) => m.encode(dst),
            QueuePurge(m) => m.encode(dst),
            QueuePurgeOk(m) => m.encode(dst),
            QueueDelete(m) => m.encode(dst),
            QueueDeleteOk(m) => m.encode(dst),

            BasicQos(m) => m.encode(dst),
            BasicConsume(m) => m.encode(dst),
            BasicConsumeOk(m) => m.encode(dst),
            BasicCancel(m) => m.encode(dst),
            BasicCancelOk(m) => m.encode(dst),
            BasicPublish(m) => m.encode(dst),
            BasicReturn(m) => m.encode(dst),
            BasicDeliver(m) => m.encode(dst),
            BasicGet(m) => m.encode(dst),
            BasicGetOk(m) => m.encode(dst),
            BasicAck(m) => m.encode(dst),
            BasicReject(m) => m.encode(dst),
            BasicRecover(m) => m.encode(dst),
            BasicNack(m) => m.encode(dst),

            ConfirmSelect(m) => m.encode(dst),

            // argument-less methods
            ConnectionCloseOk | ConnectionUnblocked | ChannelCloseOk | ExchangeDeclareOk
            | ExchangeDeleteOk | ExchangeBindOk | ExchangeUnbindOk | QueueBindOk
            | QueueUnbindOk | BasicQosOk | BasicRecoverOk | ConfirmSelectOk => {}
            BasicGetEmpty => {
                // reserved short string (cluster-id)
                dst.put_u8(0);
            }
        }
    }

    /// Decodes a method frame payload: class id, method id, arguments
    pub fn decode(src: &mut Bytes) -> Result<Self, Error> {
        use Method::*;

        ensure(src, 4)?;
        let class_id = src.get_u16();
        let method_id = src.get_u16();
        let method = match (class_id, method_id) {
            (CLASS_CONNECTION, connection::START) => {
                ConnectionStart(connection::Start::decode(src)?)
            }
            (CLASS_CONNECTION, connection::START_OK) => {
                ConnectionStartOk(connection::StartOk::decode(src)?)
            }
            (CLASS_CONNECTION, connection::SECURE) => {
                ConnectionSecure(connection::Secure::decode(src)?)
            }
            (CLASS_CONNECTION, connection::SECURE_OK) => {
                ConnectionSecureOk(connection::SecureOk::decode(src)?)
            }
            (CLASS_CONNECTION, connection::TUNE) => ConnectionTune(connection::Tune::decode(src)?),
            (CLASS_CONNECTION, connection::TUNE_OK) => {
                ConnectionTuneOk(connection::TuneOk::decode(src)?)
            }
            (CLASS_CONNECTION, connection::OPEN) => ConnectionOpen(connection::Open::decode(src)?),
            (CLASS_CONNECTION, connection::OPEN_OK) => {
                ConnectionOpenOk(connection::OpenOk::decode(src)?)
            }
            (CLASS_CONNECTION, connection::CLOSE) => {
                ConnectionClose(connection::Close::decode(src)?)
            }
            (CLASS_CONNECTION, connection::CLOSE_OK) => ConnectionCloseOk,
            (CLASS_CONNECTION, connection::BLOCKED) => {
                ConnectionBlocked(connection::Blocked::decode(src)?)
            }
            (CLASS_CONNECTION, connection::UNBLOCKED) => ConnectionUnblocked,

            (CLASS_CHANNEL, channel::OPEN) => ChannelOpen(channel::Open::decode(src)?),
            (CLASS_CHANNEL, channel::OPEN_OK) => ChannelOpenOk(channel::OpenOk::decode(src)?),
            (CLASS_CHANNEL, channel::FLOW) => ChannelFlow(channel::Flow::decode(src)?),
            (CLASS_CHANNEL, channel::FLOW_OK) => ChannelFlowOk(channel::FlowOk::decode(src)?),
            (CLASS_CHANNEL, channel::CLOSE) => ChannelClose(channel::Close::decode(src)?),
            (CLASS_CHANNEL, channel::CLOSE_OK) => ChannelCloseOk,

            (CLASS_EXCHANGE, exchange::DECLARE) => ExchangeDeclare(exchange::Declare::decode(src)?),
            (CLASS_EXCHANGE, exchange::DECLARE_OK) => ExchangeDeclareOk,
            (CLASS_EXCHANGE, exchange::DELETE) => ExchangeDelete(exchange::Delete::decode(src)?),
            (CLASS_EXCHANGE, exchange::DELETE_OK) => ExchangeDeleteOk,
            (CLASS_EXCHANGE, exchange::BIND) => ExchangeBind(exchange::Bind::decode(src)?),
            (CLASS_EXCHANGE, exchange::BIND_OK) => ExchangeBindOk,
            (CLASS_EXCHANGE, exchange::UNBIND) => ExchangeUnbind(exchange::Unbind::decode(src)?),
            (CLASS_EXCHANGE, exchange::UNBIND_OK) => ExchangeUnbindOk,

            (CLASS_QUEUE, queue::DECLARE) => QueueDeclare(queue::Declare::decode(src)?),
            (CLASS_QUEUE, queue::DECLARE_OK) => QueueDeclareOk(queue::DeclareOk::decode(src)?),
            (CLASS_QUEUE, queue::BIND) => QueueBind(queue::Bind::decode(src)?),
            (CLASS_QUEUE, queue::BIND_OK) => QueueBindOk,
            (CLASS_QUEUE, queue::UNBIND) => QueueUnbind(queue::Unbind::decode(src)?),
            (CLASS_QUEUE, queue::UNBIND_OK) => QueueUnbindOk,
            (CLASS_QUEUE, queue::PURGE) => QueuePurge(queue::Purge::decode(src)?),
            (CLASS_QUEUE, queue::PURGE_OK) => QueuePurgeOk(queue::PurgeOk::decode(src)?),
            (CLASS_QUEUE, queue::DELETE) => QueueDelete(queue::Delete::decode(src)?),
            (CLASS_QUEUE, queue::DELETE_OK) => QueueDeleteOk(queue::DeleteOk::decode(src)?),

            (CLASS_BASIC, basic::QOS) => BasicQos(basic::Qos::decode(src)?),
            (CLASS_BASIC, basic::QOS_OK) => BasicQosOk,
            (CLASS_BASIC, basic::CONSUME) => BasicConsume(basic::Consume::decode(src)?),
            (CLASS_BASIC, basic::CONSUME_OK) => BasicConsumeOk(basic::ConsumeOk::decode(src)?),
            (CLASS_BASIC, basic::CANCEL) => BasicCancel(basic::Cancel::decode(src)?),
            (CLASS_BASIC, basic::CANCEL_OK) => BasicCancelOk(basic::CancelOk::decode(src)?),
            (CLASS_BASIC, basic::PUBLISH) => BasicPublish(basic::Publish::decode(src)?),
            (CLASS_BASIC, basic::RETURN) => BasicReturn(basic::Return::decode(src)?),
            (CLASS_BASIC, basic::DELIVER) => BasicDeliver(basic::Deliver::decode(src)?),
            (CLASS_BASIC, basic::GET) => BasicGet(basic::Get::decode(src)?),
            (CLASS_BASIC, basic::GET_OK) => BasicGetOk(basic::GetOk::decode(src)?),
            (CLASS_BASIC, basic::GET_EMPTY) => {
                let _reserved = crate::types::ShortString::decode(src)?;
                BasicGetEmpty
            }
            (CLASS_BASIC, basic::ACK) => BasicAck(basic::Ack::decode(src)?),
            (CLASS_BASIC, basic::REJECT) => BasicReject(basic::Reject::decode(src)?),
            (CLASS_BASIC, basic::RECOVER) => BasicRecover(basic::Recover::decode(src)?),
            (CLASS_BASIC, basic::RECOVER_OK) => BasicRecoverOk,
            (CLASS_BASIC, basic::NACK) => BasicNack(basic::Nack::decode(src)?),

            (CLASS_CONFIRM, confirm::SELECT) => ConfirmSelect(confirm::Select::decode(src)?),
            (CLASS_CONFIRM, confirm::SELECT_OK) => ConfirmSelectOk,

            _ => {
                return Err(Error::UnknownMethod {
                    class_id,
                    method_id,
                })
            }
        };
        Ok(method)
    }
}

/// Packs up to eight booleans into a single octet, first flag in bit 0
pub(crate) fn put_bits(dst: &mut BytesMut, bits: &[bool]) {
    debug_assert!(bits.len() <= 8);
    let mut byte = 0u8;
    for (i, bit) in bits.iter().enumerate() {
        if *bit {
            byte |= 1 << i;
        }
    }
    dst.put_u8(byte);
}

/// Unpacks `N` booleans from a single octet
pub(crate) fn get_bits<const N: usize>(src: &mut Bytes) -> Result<[bool; N], Error> {
    debug_assert!(N <= 8);
    ensure(src, 1)?;
    let byte = src.get_u8();
    let mut bits = [false; N];
    for (i, bit) in bits.iter_mut().enumerate() {
        *bit = byte & (1 << i) != 0;
    }
    Ok(bits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FieldTable, FieldValue, LongString};

    pub(crate) fn roundtrip(method: Method) -> Method {
        let mut buf = BytesMut::new();
        method.encode(&mut buf);
        let mut src = buf.freeze();
        let decoded = Method::decode(&mut src).unwrap();
        assert!(!src.has_remaining(), "trailing bytes after {decoded:?}");
        decoded
    }

    #[test]
    fn unknown_method_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u16(10);
        buf.put_u16(99);
        let mut src = buf.freeze();
        assert!(matches!(
            Method::decode(&mut src),
            Err(Error::UnknownMethod {
                class_id: 10,
                method_id: 99
            })
        ));
    }

    #[test]
    fn start_ok_roundtrip() {
        let mut props = FieldTable::new();
        props.insert(
            "product".try_into().unwrap(),
            FieldValue::LongString("coney".into()),
        );
        let method = Method::ConnectionStartOk(connection::StartOk {
            client_properties: props,
            mechanism: "PLAIN".try_into().unwrap(),
            response: LongString::from(b"\x00guest\x00guest".to_vec()),
            locale: "en_US".try_into().unwrap(),
        });
        assert_eq!(roundtrip(method.clone()), method);
    }

    #[test]
    fn exchange_unbind_ok_uses_off_pattern_id() {
        // exchange.unbind-ok is 51, not 41, per the published XML
        assert_eq!(Method::ExchangeUnbindOk.method_id(), 51);
        assert_eq!(roundtrip(Method::ExchangeUnbindOk), Method::ExchangeUnbindOk);
    }

    #[test]
    fn argless_methods_roundtrip() {
        for method in [
            Method::ConnectionCloseOk,
            Method::ConnectionUnblocked,
            Method::ChannelCloseOk,
            Method::ExchangeDeclareOk,
            Method::QueueBindOk,
            Method::BasicQosOk,
            Method::BasicGetEmpty,
            Method::BasicRecoverOk,
            Method::ConfirmSelectOk,
        ] {
            assert_eq!(roundtrip(method.clone()), method);
        }
    }
}
