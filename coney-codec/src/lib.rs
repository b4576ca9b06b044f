#![deny(missing_docs, missing_debug_implementations)]

//! Wire model and frame codec for the AMQP 0-9-1 protocol.
//!
//! This crate knows nothing about sockets or tasks. It defines the frame,
//! method, and content-header types exchanged on an AMQP 0-9-1 connection
//! together with a [`FrameCodec`] that plugs into
//! `tokio_util::codec::{FramedRead, FramedWrite}`.
//!
//! All multi-byte integers on the wire are big-endian. Method arguments are
//! packed positionally, with runs of adjacent boolean arguments sharing bit
//! positions in a single octet.

pub mod constants;
pub mod content;
pub mod frame;
pub mod method;
pub mod types;

mod error;
pub use error::Error;

pub use content::{BasicProperties, ContentHeader};
pub use frame::{content_frames, Frame, FrameCodec, FramePayload};
pub use method::Method;
pub use types::{Decimal, FieldArray, FieldTable, FieldValue, LongString, ShortString, Timestamp};
