//! Transport parameters exchanged during the cryptographic handshake
//!
//! Read-only snapshots once the handshake reports completion.

use bytes::{Buf, BufMut};

use crate::coding::{BufExt, BufMutExt, Codec, UnexpectedEnd};
use crate::shared::{ConnectionId, ResetToken};
use crate::transport_error::Error as TransportError;
use crate::{VarInt, MAX_CID_SIZE, RESET_TOKEN_SIZE};

macro_rules! params {
    {$($(#[$doc:meta])* $name:ident ($id:expr) = $default:expr,)*} => {
        /// Transport parameters used to negotiate connection-level behavior with the peer
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct TransportParameters {
            $($(#[$doc])* pub $name: VarInt,)*
            /// Whether the endpoint forbids migration of the connection by its peer
            pub disable_migration: bool,
            /// Token used by the peer to verify a stateless reset
            pub stateless_reset_token: Option<ResetToken>,
            /// The DCID from the first Initial packet, echoed by a server that sent RETRY
            pub original_connection_id: Option<ConnectionId>,
        }

        impl Default for TransportParameters {
            fn default() -> Self {
                Self {
                    $($name: VarInt::from_u32($default),)*
                    disable_migration: false,
                    stateless_reset_token: None,
                    original_connection_id: None,
                }
            }
        }

        impl TransportParameters {
            /// Encode the parameter block, prefixed with its total length
            pub fn write<W: BufMut>(&self, w: &mut W) {
                let mut body = Vec::new();
                $(
                    if self.$name.into_inner() != $default as u64 {
                        body.write::<u16>($id);
                        body.write::<u16>(self.$name.size() as u16);
                        self.$name.encode(&mut body);
                    }
                )*
                if self.disable_migration {
                    body.write::<u16>(0x000c);
                    body.write::<u16>(0);
                }
                if let Some(ref token) = self.stateless_reset_token {
                    body.write::<u16>(0x0002);
                    body.write::<u16>(RESET_TOKEN_SIZE as u16);
                    body.put_slice(token);
                }
                if let Some(ref cid) = self.original_connection_id {
                    body.write::<u16>(0x0000);
                    body.write::<u16>(cid.len() as u16);
                    body.put_slice(cid);
                }
                w.write::<u16>(body.len() as u16);
                w.put_slice(&body);
            }

            /// Decode a parameter block produced by `write`
            pub fn read<R: Buf>(r: &mut R) -> Result<Self, TransportError> {
                let body_len = r.get::<u16>().map_err(malformed)? as usize;
                if r.remaining() < body_len {
                    return Err(malformed(UnexpectedEnd));
                }
                let mut params = Self::default();
                let mut remaining = body_len;
                while remaining > 0 {
                    if remaining < 4 {
                        return Err(malformed(UnexpectedEnd));
                    }
                    let id = r.get::<u16>().map_err(malformed)?;
                    let len = r.get::<u16>().map_err(malformed)? as usize;
                    if r.remaining() < len || remaining < 4 + len {
                        return Err(malformed(UnexpectedEnd));
                    }
                    remaining -= 4 + len;
                    match id {
                        $(
                            $id => {
                                let mut bytes = r.copy_to_bytes(len);
                                params.$name = VarInt::decode(&mut bytes).map_err(malformed)?;
                            }
                        )*
                        0x000c => {
                            if len != 0 {
                                return Err(TransportError::TRANSPORT_PARAMETER_ERROR(
                                    "malformed disable_migration",
                                ));
                            }
                            params.disable_migration = true;
                        }
                        0x0002 => {
                            if len != RESET_TOKEN_SIZE {
                                return Err(TransportError::TRANSPORT_PARAMETER_ERROR(
                                    "malformed stateless_reset_token",
                                ));
                            }
                            let mut token = [0; RESET_TOKEN_SIZE];
                            r.copy_to_slice(&mut token);
                            params.stateless_reset_token = Some(token.into());
                        }
                        0x0000 => {
                            if len > MAX_CID_SIZE {
                                return Err(TransportError::TRANSPORT_PARAMETER_ERROR(
                                    "malformed original_connection_id",
                                ));
                            }
                            let mut cid = [0; MAX_CID_SIZE];
                            r.copy_to_slice(&mut cid[..len]);
                            params.original_connection_id = Some(ConnectionId::new(&cid[..len]));
                        }
                        _ => {
                            // Unknown parameters are ignored
                            r.advance(len);
                        }
                    }
                }
                Ok(params)
            }
        }
    }
}

fn malformed(_: UnexpectedEnd) -> TransportError {
    TransportError::TRANSPORT_PARAMETER_ERROR("malformed transport parameters")
}

params! {
    /// Milliseconds of inactivity after which a connection is closed
    idle_timeout(0x0001) = 0,
    /// The maximum UDP payload size the endpoint is willing to receive
    max_packet_size(0x0003) = 65527,
    /// Initial value for the maximum amount of data that can be sent on the connection
    initial_max_data(0x0004) = 0,
    /// Initial flow control limit for locally-initiated bidirectional streams
    initial_max_stream_data_bidi_local(0x0005) = 0,
    /// Initial flow control limit for peer-initiated bidirectional streams
    initial_max_stream_data_bidi_remote(0x0006) = 0,
    /// Initial flow control limit for unidirectional streams
    initial_max_stream_data_uni(0x0007) = 0,
    /// Initial maximum number of bidirectional streams the peer may initiate
    initial_max_streams_bidi(0x0008) = 0,
    /// Initial maximum number of unidirectional streams the peer may initiate
    initial_max_streams_uni(0x0009) = 0,
    /// Exponent used to decode the ACK Delay field
    ack_delay_exponent(0x000a) = 3,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let mut params = TransportParameters {
            initial_max_data: VarInt::from_u32(1_048_576),
            initial_max_stream_data_bidi_local: VarInt::from_u32(65_536),
            initial_max_stream_data_bidi_remote: VarInt::from_u32(65_536),
            initial_max_stream_data_uni: VarInt::from_u32(32_768),
            idle_timeout: VarInt::from_u32(30_000),
            disable_migration: true,
            stateless_reset_token: Some([0xaa; RESET_TOKEN_SIZE].into()),
            ..TransportParameters::default()
        };
        params.original_connection_id = Some(ConnectionId::new(&[1, 2, 3, 4, 5, 6, 7, 8]));

        let mut buf = Vec::new();
        params.write(&mut buf);
        let decoded = TransportParameters::read(&mut std::io::Cursor::new(&buf)).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn unknown_parameter_skipped() {
        let params = TransportParameters::default();
        let mut buf = Vec::new();
        params.write(&mut buf);
        // Splice in an unknown parameter
        let mut body = vec![0u8, 0x40, 0, 2, 0xab, 0xcd];
        body.extend_from_slice(&buf[2..]);
        let mut full = ((body.len()) as u16).to_be_bytes().to_vec();
        full.extend_from_slice(&body);
        let decoded = TransportParameters::read(&mut std::io::Cursor::new(&full)).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn truncated_rejected() {
        let mut buf = Vec::new();
        TransportParameters {
            initial_max_data: VarInt::from_u32(12345),
            ..TransportParameters::default()
        }
        .write(&mut buf);
        buf.truncate(buf.len() - 1);
        assert!(TransportParameters::read(&mut std::io::Cursor::new(&buf)).is_err());
    }
}
