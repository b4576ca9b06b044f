//! SASL mechanism selection and response construction
//!
//! The server advertises a space-separated mechanism list in
//! `connection.start`; the client picks the first configured mechanism
//! present in that list, in configured preference order.

use coney_codec::LongString;

pub(crate) const PLAIN: &str = "PLAIN";
pub(crate) const EXTERNAL: &str = "EXTERNAL";

/// A SASL mechanism the client is willing to use
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaslMechanism {
    /// PLAIN: username and password, NUL separated
    Plain,

    /// EXTERNAL: identity taken from the transport, e.g. a client
    /// certificate; the response is empty
    External,

    /// A token-style mechanism such as an OAuth 2 plugin; the configured
    /// password is sent verbatim as the response, initially and for every
    /// `connection.secure` challenge
    Token {
        /// Mechanism name as advertised by the server
        mechanism: String,
    },
}

impl SaslMechanism {
    /// The mechanism name sent in `connection.start-ok`
    pub fn name(&self) -> &str {
        match self {
            Self::Plain => PLAIN,
            Self::External => EXTERNAL,
            Self::Token { mechanism } => mechanism,
        }
    }

    pub(crate) fn initial_response(&self, username: &str, password: &str) -> LongString {
        match self {
            Self::Plain => {
                let mut buf = Vec::with_capacity(username.len() + password.len() + 2);
                buf.push(0);
                buf.extend_from_slice(username.as_bytes());
                buf.push(0);
                buf.extend_from_slice(password.as_bytes());
                LongString::from(buf)
            }
            Self::External => LongString::default(),
            Self::Token { .. } => LongString::from(password),
        }
    }

    /// Response to a `connection.secure` challenge. None of the supported
    /// mechanisms is multi-round, so the initial response is re-sent.
    pub(crate) fn challenge_response(&self, username: &str, password: &str) -> LongString {
        self.initial_response(username, password)
    }
}

/// Picks the first configured mechanism present in the server list
pub(crate) fn select(
    configured: &[SaslMechanism],
    advertised: &str,
) -> Option<SaslMechanism> {
    let server: Vec<&str> = advertised.split_ascii_whitespace().collect();
    configured
        .iter()
        .find(|m| server.iter().any(|s| *s == m.name()))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_initial_response() {
        let response = SaslMechanism::Plain.initial_response("user", "secret");
        assert_eq!(response.as_bytes(), b"\x00user\x00secret");
    }

    #[test]
    fn external_sends_empty_response() {
        let response = SaslMechanism::External.initial_response("user", "secret");
        assert!(response.as_bytes().is_empty());
    }

    #[test]
    fn selection_respects_configured_order() {
        let configured = vec![SaslMechanism::External, SaslMechanism::Plain];
        let selected = select(&configured, "PLAIN AMQPLAIN EXTERNAL").unwrap();
        assert_eq!(selected, SaslMechanism::External);

        let selected = select(&[SaslMechanism::Plain], "PLAIN").unwrap();
        assert_eq!(selected, SaslMechanism::Plain);
    }

    #[test]
    fn empty_intersection_selects_nothing() {
        assert!(select(&[SaslMechanism::External], "PLAIN AMQPLAIN").is_none());
        assert!(select(&[], "PLAIN").is_none());
    }

    #[test]
    fn token_mechanism_sends_password() {
        let mech = SaslMechanism::Token {
            mechanism: "RABBIT-OAUTH2".into(),
        };
        assert_eq!(mech.name(), "RABBIT-OAUTH2");
        let response = mech.initial_response("ignored", "tok-123");
        assert_eq!(response.as_bytes(), b"tok-123");
    }
}
