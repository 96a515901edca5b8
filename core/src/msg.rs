//! The C2 wire unit: `{type: u8, data: bytes}`.

use serde::{Deserialize, Serialize};

/// Known message types carried on the C2 channel. The wire carries a single
/// byte discriminator; this is the closed tagged union spec §9 calls for —
/// an unknown tag is a decode error, never a silent default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Msgtype {
    Vmdata = 0,
    Signal = 1,
    Reserved = 2,
}

impl Msgtype {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Msgtype::Vmdata),
            1 => Some(Msgtype::Signal),
            2 => Some(Msgtype::Reserved),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A decoded message: the type tag plus its raw payload. The payload is
/// decoded further by the caller depending on `typ` (e.g. `Vmdata`'s
/// payload is a bincode-encoded [`crate::descriptor::Data`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Msg {
    pub typ: Msgtype,
    pub data: Vec<u8>,
}

impl Msg {
    pub fn vmdata(payload: Vec<u8>) -> Self {
        Msg {
            typ: Msgtype::Vmdata,
            data: payload,
        }
    }

    /// A `Signal` message's payload is always exactly one byte: the signal
    /// number.
    pub fn signal(signum: i32) -> Self {
        Msg {
            typ: Msgtype::Signal,
            data: vec![signum as u8],
        }
    }

    /// Extracts the signal number from a `Signal` message's single-byte
    /// payload.
    pub fn signal_number(&self) -> Option<i32> {
        if self.typ != Msgtype::Signal || self.data.len() != 1 {
            return None;
        }
        Some(self.data[0] as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msgtype_roundtrip() {
        for b in 0u8..3 {
            let t = Msgtype::from_u8(b).unwrap();
            assert_eq!(t.as_u8(), b);
        }
    }

    #[test]
    fn test_msgtype_unknown_is_none() {
        assert!(Msgtype::from_u8(3).is_none());
        assert!(Msgtype::from_u8(255).is_none());
    }

    #[test]
    fn test_signal_message_roundtrip() {
        let m = Msg::signal(15);
        assert_eq!(m.typ, Msgtype::Signal);
        assert_eq!(m.signal_number(), Some(15));
    }

    #[test]
    fn test_signal_number_none_for_vmdata() {
        let m = Msg::vmdata(vec![1, 2, 3]);
        assert_eq!(m.signal_number(), None);
    }
}
