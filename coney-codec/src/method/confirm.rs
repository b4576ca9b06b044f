//! `confirm` class methods (class id 85, RabbitMQ extension)

use bytes::{Bytes, BytesMut};

use super::{get_bits, put_bits};
use crate::Error;

pub(crate) const SELECT: u16 = 10;
pub(crate) const SELECT_OK: u16 = 11;

/// `confirm.select` — put the channel into publisher-confirm mode
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Select {
    /// Do not wait for select-ok
    pub no_wait: bool,
}

impl Select {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        put_bits(dst, &[self.no_wait]);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        Ok(Self {
            no_wait: get_bits::<1>(src)?[0],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::tests::roundtrip;
    use crate::method::Method;

    #[test]
    fn select_roundtrip() {
        let method = Method::ConfirmSelect(Select { no_wait: false });
        assert_eq!(roundtrip(method.clone()), method);
    }
}
