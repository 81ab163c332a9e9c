// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Connection handshake and per-call frame header
//!
//! A client opens a stream and immediately sends a [`HandshakeOption`] as a
//! single JSON frame. JSON is used regardless of the codec the client asks
//! for, so the server can learn which codec to switch to before decoding
//! anything else. After the handshake every call is one [`Header`] frame
//! followed by one body frame, both encoded with the negotiated codec.

use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use crate::codec::{CodecType, FrameReader, FrameWriter};
use crate::error::{Result, RpcError};

/// Marks a stream as a beeRPC connection.
pub const MAGIC_NUMBER: u32 = 0x3bef5c;

/// Default bound on the time spent connecting and handshaking.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// One-time negotiation message, sent client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeOption {
    pub magic_number: u32,

    /// Identifier of the codec used for the rest of the connection
    pub codec_type: String,

    /// Bound on dialing plus handshake, zero means no bound
    #[serde(default)]
    pub connect_timeout: Duration,

    /// Bound on each server-side method invocation, zero means no bound
    #[serde(default)]
    pub handle_timeout: Duration,
}

impl Default for HandshakeOption {
    fn default() -> Self {
        HandshakeOption {
            magic_number: MAGIC_NUMBER,
            codec_type: CodecType::default().to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handle_timeout: Duration::ZERO,
        }
    }
}

impl HandshakeOption {
    pub fn new() -> Self {
        HandshakeOption::default()
    }

    pub fn with_codec(self, codec: CodecType) -> Self {
        HandshakeOption {
            codec_type: codec.to_string(),
            ..self
        }
    }

    pub fn with_connect_timeout(self, connect_timeout: Duration) -> Self {
        HandshakeOption {
            connect_timeout,
            ..self
        }
    }

    pub fn with_handle_timeout(self, handle_timeout: Duration) -> Self {
        HandshakeOption {
            handle_timeout,
            ..self
        }
    }

    /// Resolve the codec identifier carried by this option.
    pub fn codec(&self) -> Result<CodecType> {
        self.codec_type.parse()
    }

    /// Fill in what a caller is allowed to leave out and reject what cannot
    /// be sent. The magic number is always forced to [`MAGIC_NUMBER`].
    pub fn normalize(mut self) -> Result<Self> {
        self.magic_number = MAGIC_NUMBER;
        if self.codec_type.is_empty() {
            self.codec_type = CodecType::default().to_string();
        }

        self.codec()
            .map_err(|e| RpcError::Config(format!("rpc client: codec error: {}", e)))?;

        Ok(self)
    }

    pub fn to_frame(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| RpcError::Encode(e.to_string()))
    }

    pub fn from_frame(buf: &[u8]) -> Result<Self> {
        serde_json::from_slice(buf).map_err(|e| RpcError::Handshake(e.to_string()))
    }
}

/// Metadata preceding every request and response body.
///
/// Request and response of the same call carry the same `service_method`
/// and `seq`. `error` is empty on requests and on successful responses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// "Service.Method"
    pub service_method: String,

    /// Sequence number chosen by the client, 0 is never used
    pub seq: u64,

    pub error: String,
}

impl Header {
    pub fn new(service_method: impl Into<String>, seq: u64) -> Self {
        Header {
            service_method: service_method.into(),
            seq,
            error: String::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}

/// Read the handshake frame. Must be the first frame of the connection.
pub async fn read_handshake(frames: &mut FrameReader) -> Result<HandshakeOption> {
    match frames.next().await {
        Some(Ok(frame)) => HandshakeOption::from_frame(&frame),
        Some(Err(e)) => Err(RpcError::Handshake(e.to_string())),
        None => Err(RpcError::ConnectionClosed),
    }
}

pub async fn write_handshake(frames: &mut FrameWriter, option: &HandshakeOption) -> Result<()> {
    frames.send(option.to_frame()?).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_option() {
        let option = HandshakeOption::default();
        assert_eq!(option.magic_number, MAGIC_NUMBER);
        assert_eq!(option.codec().unwrap(), CodecType::Bincode);
        assert_eq!(option.connect_timeout, Duration::from_secs(10));
        assert!(option.handle_timeout.is_zero());
    }

    #[test]
    fn test_option_frame_is_json() {
        let option = HandshakeOption::new()
            .with_codec(CodecType::Json)
            .with_handle_timeout(Duration::from_millis(100));

        let frame = option.to_frame().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(value["magic_number"], MAGIC_NUMBER);
        assert_eq!(value["codec_type"], "application/json");

        assert_eq!(HandshakeOption::from_frame(&frame).unwrap(), option);
    }

    #[test]
    fn test_option_garbage_frame() {
        let res = HandshakeOption::from_frame(b"GET / HTTP/1.1\r\n");
        assert!(matches!(res, Err(RpcError::Handshake(_))));
    }

    #[test]
    fn test_normalize() {
        let option = HandshakeOption {
            magic_number: 42,
            codec_type: String::new(),
            connect_timeout: Duration::ZERO,
            handle_timeout: Duration::ZERO,
        };

        let option = option.normalize().unwrap();
        assert_eq!(option.magic_number, MAGIC_NUMBER);
        assert_eq!(option.codec_type, "application/bincode");

        let option = HandshakeOption {
            codec_type: "application/gob".to_string(),
            ..HandshakeOption::default()
        };
        assert!(matches!(option.normalize(), Err(RpcError::Config(_))));
    }

    #[test]
    fn test_header() {
        let header = Header::new("Foo.Sum", 7);
        assert_eq!(header.seq, 7);
        assert!(!header.is_error());
    }
}
