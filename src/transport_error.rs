use std::fmt;

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::coding::{self, BufExt, BufMutExt};
use crate::frame::FrameType;

/// Transport-level errors occurring when a peer violates the protocol specification
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub struct Error {
    /// Type of error
    pub code: Code,
    /// Frame type that triggered the error
    pub frame: Option<FrameType>,
    /// Human-readable explanation of the reason
    pub reason: String,
}

impl Error {
    pub(crate) fn new(code: Code, reason: impl Into<String>) -> Self {
        Self {
            code,
            frame: None,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if !self.reason.is_empty() {
            write!(f, ": {}", self.reason)?;
        }
        Ok(())
    }
}

/// Transport-level error code
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Code(u16);

impl Code {
    /// Create a QUIC error code from a TLS alert code
    pub fn crypto(code: u8) -> Self {
        Self(0x100 | u16::from(code))
    }
}

impl coding::Codec for Code {
    fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        Ok(Self(buf.get::<u16>()?))
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write::<u16>(self.0)
    }
}

impl From<Code> for u16 {
    fn from(x: Code) -> Self {
        x.0
    }
}

impl From<u16> for Code {
    fn from(x: u16) -> Self {
        Self(x)
    }
}

macro_rules! errors {
    {$($name:ident($val:expr) $desc:expr;)*} => {
        impl Code {
            $(#[doc = $desc] pub const $name: Self = Code($val);)*
        }

        impl Error {
            $(
                #[doc = $desc]
                #[allow(non_snake_case, unused)]
                pub(crate) fn $name(reason: impl Into<String>) -> Self {
                    Self::new(Code::$name, reason)
                }
            )*
        }

        impl fmt::Debug for Code {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    x if (0x100..0x200).contains(&x) => write!(f, "Code::crypto({:02x})", self.0 as u8),
                    _ => write!(f, "Code({:04x})", self.0),
                }
            }
        }

        impl fmt::Display for Code {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let x = match self.0 {
                    $($val => $desc,)*
                    _ if self.0 >= 0x100 && self.0 < 0x200 => "the cryptographic handshake failed",
                    _ => "unknown error",
                };
                f.write_str(x)
            }
        }
    }
}

errors! {
    NO_ERROR(0x0) "the connection is being closed abruptly in the absence of any error";
    INTERNAL_ERROR(0x1) "the endpoint encountered an internal error and cannot continue with the connection";
    SERVER_BUSY(0x2) "the server is currently busy and does not accept any new connections";
    FLOW_CONTROL_ERROR(0x3) "an endpoint received more data than it permitted in its advertised data limits";
    STREAM_LIMIT_ERROR(0x4) "an endpoint received a frame for a stream identifier that exceeded its advertised stream limit";
    STREAM_STATE_ERROR(0x5) "an endpoint received a frame for a stream that was not in a state that permitted that frame";
    FINAL_SIZE_ERROR(0x6) "an endpoint received data that exceeded the previously established final size of a stream";
    FRAME_ENCODING_ERROR(0x7) "an endpoint received a frame that was badly formatted";
    TRANSPORT_PARAMETER_ERROR(0x8) "an endpoint received transport parameters that were badly formatted or otherwise in error";
    VERSION_NEGOTIATION_ERROR(0x9) "an endpoint detected a potential version downgrade";
    PROTOCOL_VIOLATION(0xA) "an endpoint detected an error with protocol compliance that was not covered by more specific error codes";
    INVALID_MIGRATION(0xC) "an endpoint received a PATH_RESPONSE frame that did not correspond to any PATH_CHALLENGE it sent";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_roundtrip() {
        use crate::coding::Codec;
        let mut buf = Vec::new();
        Code::FLOW_CONTROL_ERROR.encode(&mut buf);
        let decoded = Code::decode(&mut std::io::Cursor::new(&buf)).unwrap();
        assert_eq!(decoded, Code::FLOW_CONTROL_ERROR);
    }

    #[test]
    fn display_includes_reason() {
        let err = Error::PROTOCOL_VIOLATION("received zero-length cid");
        let s = err.to_string();
        assert!(s.contains("zero-length cid"));
    }
}
