// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::str::FromStr;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::error::{Result, RpcError};
use crate::protocol::Header;

/// Upper bound for a single header or body frame.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub type FrameReader = FramedRead<BoxedReader, LengthDelimitedCodec>;
pub type FrameWriter = FramedWrite<BoxedWriter, LengthDelimitedCodec>;

/// Serialization formats a connection can negotiate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CodecType {
    #[default]
    Bincode,
    Json,
}

impl CodecType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            CodecType::Bincode => "application/bincode",
            CodecType::Json => "application/json",
        }
    }

    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            CodecType::Bincode => {
                bincode::serde::encode_to_vec(value, bincode::config::standard())
                    .map_err(|e| RpcError::Encode(e.to_string()))
            }
            CodecType::Json => {
                serde_json::to_vec(value).map_err(|e| RpcError::Encode(e.to_string()))
            }
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T> {
        match self {
            CodecType::Bincode => {
                bincode::serde::decode_from_slice(buf, bincode::config::standard())
                    .map(|(value, _)| value)
                    .map_err(|e| RpcError::Decode(e.to_string()))
            }
            CodecType::Json => {
                serde_json::from_slice(buf).map_err(|e| RpcError::Decode(e.to_string()))
            }
        }
    }
}

impl fmt::Display for CodecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CodecType {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "application/bincode" => Ok(CodecType::Bincode),
            "application/json" => Ok(CodecType::Json),
            other => Err(RpcError::InvalidCodec(other.to_string())),
        }
    }
}

fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Split a byte stream into a length-delimited frame reader and writer.
pub fn split_stream<S>(stream: S) -> (FrameReader, FrameWriter)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let reader: BoxedReader = Box::new(read_half);
    let writer: BoxedWriter = Box::new(write_half);

    (
        FramedRead::new(reader, frame_codec()),
        FramedWrite::new(writer, frame_codec()),
    )
}

/// Reading side of a connection once the codec is negotiated.
///
/// A call is always a header frame followed by a body frame, so after a
/// successful [`CodecReader::read_header`] the caller must consume the body
/// with one of the body methods before reading the next header.
pub struct CodecReader {
    frames: FrameReader,
    codec: CodecType,
}

impl CodecReader {
    pub fn new(frames: FrameReader, codec: CodecType) -> Self {
        CodecReader { frames, codec }
    }

    pub fn codec(&self) -> CodecType {
        self.codec
    }

    async fn next_frame(&mut self) -> Result<BytesMut> {
        match self.frames.next().await {
            Some(Ok(frame)) => Ok(frame),
            Some(Err(e)) => Err(RpcError::Io(e)),
            None => Err(RpcError::ConnectionClosed),
        }
    }

    pub async fn read_header(&mut self) -> Result<Header> {
        let frame = self.next_frame().await?;
        self.codec.decode(&frame)
    }

    /// Read the body frame without decoding it.
    pub async fn read_body(&mut self) -> Result<Bytes> {
        Ok(self.next_frame().await?.freeze())
    }

    pub async fn read_body_as<T: DeserializeOwned>(&mut self) -> Result<T> {
        let frame = self.next_frame().await?;
        self.codec.decode(&frame)
    }

    pub async fn discard_body(&mut self) -> Result<()> {
        self.next_frame().await.map(|_| ())
    }
}

/// Writing side of a connection once the codec is negotiated.
///
/// Header and body of one message are flushed together. Callers sharing a
/// connection must serialize access, see the server and client send locks.
pub struct CodecWriter {
    frames: FrameWriter,
    codec: CodecType,
}

impl CodecWriter {
    pub fn new(frames: FrameWriter, codec: CodecType) -> Self {
        CodecWriter { frames, codec }
    }

    pub fn codec(&self) -> CodecType {
        self.codec
    }

    /// Encode and write one message. Nothing is written if the body cannot
    /// be encoded.
    pub async fn write<T: Serialize + ?Sized>(&mut self, header: &Header, body: &T) -> Result<()> {
        let body = self.codec.encode(body)?;
        self.write_raw(header, Bytes::from(body)).await
    }

    /// Write one message whose body is already encoded with this codec.
    pub async fn write_raw(&mut self, header: &Header, body: Bytes) -> Result<()> {
        let header = self.codec.encode(header)?;

        self.frames.feed(Bytes::from(header)).await?;
        self.frames.feed(body).await?;
        SinkExt::<Bytes>::flush(&mut self.frames).await?;

        Ok(())
    }

    /// Flush and shut down the write direction of the stream.
    pub async fn close(&mut self) -> Result<()> {
        SinkExt::<Bytes>::close(&mut self.frames).await?;
        Ok(())
    }
}
