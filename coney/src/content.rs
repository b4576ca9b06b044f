//! Reassembles HEADER and BODY frames into complete messages
//!
//! After a content-bearing method the channel expects exactly one header
//! frame, then body frames until the accumulated length equals the
//! header's `body_size`. Any method frame arriving mid-assembly, a body
//! overrun, or an unexpected header/body frame is a framing error and is
//! escalated as connection-fatal by the dispatcher.

use bytes::{BufMut, Bytes, BytesMut};
use coney_codec::{BasicProperties, ContentHeader, Method};

use crate::error::Error;

/// A fully reassembled inbound message
#[derive(Debug)]
pub(crate) struct AssembledMessage {
    /// The content-bearing method that announced the message
    pub method: Method,
    /// Properties from the content header
    pub properties: BasicProperties,
    /// The complete body
    pub body: Bytes,
}

#[derive(Debug)]
enum AssemblerState {
    Idle,
    AwaitingHeader {
        method: Method,
    },
    AwaitingBody {
        method: Method,
        properties: BasicProperties,
        expected: u64,
        buf: BytesMut,
    },
}

/// Per-channel content assembly state machine
#[derive(Debug)]
pub(crate) struct ContentAssembler {
    max_body_size: usize,
    state: AssemblerState,
}

impl ContentAssembler {
    pub fn new(max_body_size: usize) -> Self {
        Self {
            max_body_size,
            state: AssemblerState::Idle,
        }
    }

    /// Whether a content assembly is in progress; any method frame while
    /// true is a framing error
    pub fn is_assembling(&self) -> bool {
        !matches!(self.state, AssemblerState::Idle)
    }

    /// Begins assembling after a content-bearing method
    pub fn start(&mut self, method: Method) -> Result<(), Error> {
        if self.is_assembling() {
            return Err(Error::ProtocolViolation(
                "method frame received during content assembly".into(),
            ));
        }
        debug_assert!(method.carries_content());
        self.state = AssemblerState::AwaitingHeader { method };
        Ok(())
    }

    /// Feeds a content header; a zero-size body completes immediately
    pub fn on_header(&mut self, header: ContentHeader) -> Result<Option<AssembledMessage>, Error> {
        match std::mem::replace(&mut self.state, AssemblerState::Idle) {
            AssemblerState::AwaitingHeader { method } => {
                if header.body_size as usize > self.max_body_size {
                    return Err(Error::ProtocolViolation(format!(
                        "message body of {} bytes exceeds the {} byte limit",
                        header.body_size, self.max_body_size
                    )));
                }
                if header.body_size == 0 {
                    return Ok(Some(AssembledMessage {
                        method,
                        properties: header.properties,
                        body: Bytes::new(),
                    }));
                }
                self.state = AssemblerState::AwaitingBody {
                    method,
                    properties: header.properties,
                    expected: header.body_size,
                    buf: BytesMut::with_capacity(header.body_size as usize),
                };
                Ok(None)
            }
            _ => Err(Error::ProtocolViolation(
                "unexpected content header frame".into(),
            )),
        }
    }

    /// Feeds a body frame; returns the message once the size adds up
    pub fn on_body(&mut self, chunk: Bytes) -> Result<Option<AssembledMessage>, Error> {
        match std::mem::replace(&mut self.state, AssemblerState::Idle) {
            AssemblerState::AwaitingBody {
                method,
                properties,
                expected,
                mut buf,
            } => {
                if buf.len() as u64 + chunk.len() as u64 > expected {
                    return Err(Error::ProtocolViolation(format!(
                        "content body overrun: header announced {expected} bytes"
                    )));
                }
                buf.put_slice(&chunk);
                if buf.len() as u64 == expected {
                    Ok(Some(AssembledMessage {
                        method,
                        properties,
                        body: buf.freeze(),
                    }))
                } else {
                    self.state = AssemblerState::AwaitingBody {
                        method,
                        properties,
                        expected,
                        buf,
                    };
                    Ok(None)
                }
            }
            _ => Err(Error::ProtocolViolation(
                "unexpected content body frame".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use coney_codec::method::basic;

    use super::*;

    fn deliver() -> Method {
        Method::BasicDeliver(basic::Deliver {
            consumer_tag: "ctag".try_into().unwrap(),
            delivery_tag: 1,
            redelivered: false,
            exchange: "".try_into().unwrap(),
            routing_key: "q".try_into().unwrap(),
        })
    }

    fn header(body_size: u64) -> ContentHeader {
        ContentHeader {
            class_id: 60,
            body_size,
            properties: BasicProperties::default(),
        }
    }

    #[test]
    fn assembles_across_multiple_body_frames() {
        let mut assembler = ContentAssembler::new(1024);
        assembler.start(deliver()).unwrap();
        assert!(assembler.on_header(header(10)).unwrap().is_none());
        assert!(assembler
            .on_body(Bytes::from_static(b"hello "))
            .unwrap()
            .is_none());
        let message = assembler
            .on_body(Bytes::from_static(b"coney"))
            .unwrap()
            .unwrap_or_else(|| panic!("expected completion"));
        assert_eq!(&message.body[..], b"hello coney");
        assert!(!assembler.is_assembling());
    }

    #[test]
    fn zero_length_body_completes_on_header() {
        let mut assembler = ContentAssembler::new(1024);
        assembler.start(deliver()).unwrap();
        let message = assembler.on_header(header(0)).unwrap().unwrap();
        assert!(message.body.is_empty());
    }

    #[test]
    fn method_during_assembly_is_a_violation() {
        let mut assembler = ContentAssembler::new(1024);
        assembler.start(deliver()).unwrap();
        assert!(assembler.start(deliver()).is_err());
    }

    #[test]
    fn body_overrun_is_a_violation() {
        let mut assembler = ContentAssembler::new(1024);
        assembler.start(deliver()).unwrap();
        assembler.on_header(header(4)).unwrap();
        let err = assembler.on_body(Bytes::from_static(b"12345")).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }

    #[test]
    fn unexpected_header_is_a_violation() {
        let mut assembler = ContentAssembler::new(1024);
        assert!(assembler.on_header(header(4)).is_err());
        assert!(assembler.on_body(Bytes::from_static(b"x")).is_err());
    }

    #[test]
    fn oversized_body_is_rejected_at_the_header() {
        let mut assembler = ContentAssembler::new(16);
        assembler.start(deliver()).unwrap();
        assert!(assembler.on_header(header(17)).is_err());
    }
}
