//! Errors raised while encoding or decoding wire data

use std::io;

/// Error raised by the frame and method codecs
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error from the underlying transport
    #[error("IO Error {0:?}")]
    Io(#[from] io::Error),

    /// Frame declared a payload larger than the negotiated frame-max
    #[error("Frame of {size} bytes exceeds the negotiated maximum of {max}")]
    FrameTooLarge {
        /// Total frame size including overhead
        size: usize,
        /// Negotiated frame-max
        max: usize,
    },

    /// Frame was not terminated by the frame-end octet
    #[error("Expecting frame end 0xCE, found {0:#04x}")]
    InvalidFrameEnd(u8),

    /// Frame type octet is not one of METHOD, HEADER, BODY, HEARTBEAT
    #[error("Unknown frame type {0}")]
    UnknownFrameType(u8),

    /// Method frame carried an unknown (class, method) pair
    #[error("Unknown method {class_id}.{method_id}")]
    UnknownMethod {
        /// Class id of the offending method
        class_id: u16,
        /// Method id of the offending method
        method_id: u16,
    },

    /// Field table value carried an unknown tag octet
    #[error("Unknown field value tag {0:#04x}")]
    UnknownFieldTag(u8),

    /// Short string exceeded 255 bytes
    #[error("Short string of {0} bytes exceeds 255")]
    ShortStringTooLong(usize),

    /// String field was not valid UTF-8
    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,

    /// Payload ended in the middle of a value
    #[error("Payload truncated")]
    Truncated,
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(_: std::string::FromUtf8Error) -> Self {
        Self::InvalidUtf8
    }
}
