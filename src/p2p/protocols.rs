//! Kiwi protocol handlers
//!
//! Frames are a 4-byte big-endian length followed by a MessagePack body.

use std::io;

use async_trait::async_trait;
use futures::prelude::*;
use libp2p::{request_response, StreamProtocol};
use serde::{de::DeserializeOwned, Serialize};

use crate::sync::protocol::{SyncRequest, SyncResponse};

/// Protocol identifiers
pub const SYNC_PROTOCOL: &str = "/kiwi/sync/1.0.0";
pub const IDENTIFY_PROTOCOL: &str = "/kiwi/id/1.0.0";

const MAX_REQUEST_BYTES: usize = 4 * 1024 * 1024;
// Fetch responses carry whole message batches.
const MAX_RESPONSE_BYTES: usize = 32 * 1024 * 1024;

/// Length-prefixed MessagePack codec for the sync protocol.
#[derive(Debug, Clone, Default)]
pub struct SyncCodec;

async fn read_frame<T, M>(io: &mut T, max: usize) -> io::Result<M>
where
    T: AsyncRead + Unpin + Send,
    M: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds {}", len, max),
        ));
    }

    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    rmp_serde::from_slice(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

async fn write_frame<T, M>(io: &mut T, message: &M) -> io::Result<()>
where
    T: AsyncWrite + Unpin + Send,
    M: Serialize,
{
    let data = rmp_serde::to_vec_named(message)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    io.write_all(&(data.len() as u32).to_be_bytes()).await?;
    io.write_all(&data).await?;
    io.flush().await
}

#[async_trait]
impl request_response::Codec for SyncCodec {
    type Protocol = StreamProtocol;
    type Request = SyncRequest;
    type Response = SyncResponse;

    async fn read_request<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_frame(io, MAX_REQUEST_BYTES).await
    }

    async fn read_response<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
    ) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_frame(io, MAX_RESPONSE_BYTES).await
    }

    async fn write_request<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        request: Self::Request,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_frame(io, &request).await
    }

    async fn write_response<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        response: Self::Response,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_frame(io, &response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::TrieDigest;
    use crate::sync::protocol::{Hello, RequestBody, PROTOCOL_VERSION};
    use futures::io::Cursor;
    use request_response::Codec;

    fn protocol() -> StreamProtocol {
        StreamProtocol::new(SYNC_PROTOCOL)
    }

    #[tokio::test]
    async fn test_request_frame_roundtrip() {
        let request = SyncRequest::new(RequestBody::Hello(Hello {
            version: PROTOCOL_VERSION,
            root: TrieDigest::from_bytes([3u8; 32]),
            leaf_count: 12,
        }));

        let mut wire = Cursor::new(Vec::new());
        SyncCodec
            .write_request(&protocol(), &mut wire, request.clone())
            .await
            .unwrap();

        let bytes = wire.into_inner();
        let len = u32::from_be_bytes(bytes[..4].try_into().unwrap()) as usize;
        assert_eq!(len, bytes.len() - 4);

        let mut reader = Cursor::new(bytes);
        let decoded = SyncCodec.read_request(&protocol(), &mut reader).await.unwrap();
        assert_eq!(decoded, request);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut bytes = ((MAX_REQUEST_BYTES + 1) as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 16]);
        let mut reader = Cursor::new(bytes);
        let err = SyncCodec
            .read_request(&protocol(), &mut reader)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_garbage_body_rejected() {
        let mut bytes = 3u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0xc1, 0xc1, 0xc1]);
        let mut reader = Cursor::new(bytes);
        let err = SyncCodec
            .read_request(&protocol(), &mut reader)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
