//! Client wire protocol: every message in either direction is `[8-byte
//! big-endian length | MetaData JSON]` followed optionally by
//! `[gzip-compressed Container of length meta.containersize]`.
//!
//! MetaData is plain JSON rather than a binary format: only the framing,
//! routing and type-tag fields need a fixed shape, so JSON keeps the
//! framing layer introspectable and matches the management plane's own
//! JSON choice for symmetry. The Container body stays an opaque,
//! gzip-compressed blob at this layer — its internal structure (graphs,
//! attributes, results) is out of scope.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;
use crate::handlers::HandlerDescriptor;
use crate::persistence::StatusRecord;

/// `MetaData.type`. Anything that doesn't match one of the named request
/// types is treated as a job submission, preserving backward compatibility
/// for clients that don't send an explicit `NEW_JOB` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestType {
    #[serde(rename = "AUTH")]
    Auth,
    #[serde(rename = "CREATE_USER")]
    CreateUser,
    #[serde(rename = "AVAILABLE_HANDLERS")]
    AvailableHandlers,
    #[serde(rename = "STATUS")]
    Status,
    #[serde(rename = "RESULT")]
    Result,
    #[serde(rename = "ABORT_JOB")]
    AbortJob,
    #[serde(rename = "DELETE_JOB")]
    DeleteJob,
    #[serde(rename = "ORIGIN_GRAPH")]
    OriginGraph,
    #[serde(other)]
    NewJob,
}

impl RequestType {
    /// Bodyless: AUTH, AVAILABLE_HANDLERS, STATUS. Everything else reads a
    /// Container of `meta.containersize` bytes before dispatching.
    pub fn needs_body(self) -> bool {
        !matches!(
            self,
            RequestType::Auth | RequestType::AvailableHandlers | RequestType::Status
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserCredentials {
    pub name: String,
    pub password: String,
}

/// The request MetaData. `handlertype`/`jobname` are only meaningful for
/// `NewJob`; readers of other request types leave them at their default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaData {
    #[serde(rename = "type")]
    pub message_type: RequestType,
    #[serde(default)]
    pub containersize: u64,
    #[serde(default)]
    pub handlertype: String,
    #[serde(default)]
    pub jobname: String,
    pub user: UserCredentials,
}

/// Body carried by RESULT, ABORT_JOB, DELETE_JOB and ORIGIN_GRAPH.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResultRequest {
    pub jobid: i64,
}

/// Reply shapes, one per request type. Carried as the response frame's
/// MetaData; RESULT additionally carries the response blob as the frame's
/// Container.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ResponseMeta {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "NOT_FOUND")]
    NotFound,
    #[serde(rename = "STATUS")]
    Status { jobs: Vec<StatusRecord> },
    #[serde(rename = "RESULT")]
    Result { status: StatusRecord },
    #[serde(rename = "NEW_JOB_RESPONSE")]
    NewJobResponse { jobid: i64 },
    #[serde(rename = "AVAILABLE_HANDLERS")]
    AvailableHandlers { handlers: Vec<HandlerDescriptor> },
    #[serde(rename = "ERROR")]
    Error { error_type: String, message: String },
}

impl ResponseMeta {
    pub fn error(error_type: &str, message: impl Into<String>) -> Self {
        ResponseMeta::Error {
            error_type: error_type.to_owned(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ResponseFrameHeader {
    #[serde(flatten)]
    meta: ResponseMeta,
    containersize: u64,
}

const MAX_META_LEN: u64 = 16 * 1024 * 1024;
const MAX_CONTAINER_LEN: u64 = 512 * 1024 * 1024;

/// Reads one request frame: the length-prefixed MetaData, and — if
/// `meta.containersize > 0` — the gzip-compressed Container, decompressed.
pub async fn read_request<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> Result<(MetaData, Option<Vec<u8>>), ProtocolError> {
    let meta_bytes = read_length_prefixed(stream, MAX_META_LEN).await?;
    let meta: MetaData = serde_json::from_slice(&meta_bytes)
        .map_err(|e| ProtocolError::Parse(format!("MetaData: {e}")))?;

    if !meta.message_type.needs_body() && meta.containersize > 0 {
        return Err(ProtocolError::Framing(format!(
            "{:?} does not take a body but containersize was {}",
            meta.message_type, meta.containersize
        )));
    }

    if meta.containersize == 0 {
        return Ok((meta, None));
    }
    if meta.containersize > MAX_CONTAINER_LEN {
        return Err(ProtocolError::Framing(format!(
            "containersize {} exceeds limit",
            meta.containersize
        )));
    }
    let mut compressed = vec![0u8; meta.containersize as usize];
    stream
        .read_exact(&mut compressed)
        .await
        .map_err(|e| ProtocolError::Framing(format!("short container read: {e}")))?;
    let blob = decompress(&compressed)?;
    Ok((meta, Some(blob)))
}

/// Writes one response frame: `meta` (plus the computed `containersize`) as
/// length-prefixed JSON, followed by `container` gzip-compressed if present.
pub async fn write_response<W: AsyncWrite + Unpin>(
    stream: &mut W,
    meta: ResponseMeta,
    container: Option<&[u8]>,
) -> Result<(), ProtocolError> {
    let compressed = container.map(compress).transpose()?;
    let containersize = compressed.as_ref().map(|c| c.len() as u64).unwrap_or(0);

    let header = ResponseFrameHeader { meta, containersize };
    let meta_bytes = serde_json::to_vec(&header)
        .map_err(|e| ProtocolError::Parse(format!("ResponseMeta: {e}")))?;

    write_length_prefixed(stream, &meta_bytes).await?;
    if let Some(compressed) = compressed {
        stream
            .write_all(&compressed)
            .await
            .map_err(|e| ProtocolError::Framing(e.to_string()))?;
    }
    Ok(())
}

/// Writes one request frame. Used by test harnesses to simulate a client.
pub async fn write_request<W: AsyncWrite + Unpin>(
    stream: &mut W,
    mut meta: MetaData,
    container: Option<&[u8]>,
) -> Result<(), ProtocolError> {
    let compressed = container.map(compress).transpose()?;
    meta.containersize = compressed.as_ref().map(|c| c.len() as u64).unwrap_or(0);

    let meta_bytes =
        serde_json::to_vec(&meta).map_err(|e| ProtocolError::Parse(format!("MetaData: {e}")))?;
    write_length_prefixed(stream, &meta_bytes).await?;
    if let Some(compressed) = compressed {
        stream
            .write_all(&compressed)
            .await
            .map_err(|e| ProtocolError::Framing(e.to_string()))?;
    }
    Ok(())
}

async fn read_length_prefixed<R: AsyncRead + Unpin>(
    stream: &mut R,
    max_len: u64,
) -> Result<Vec<u8>, ProtocolError> {
    let mut len_buf = [0u8; 8];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| ProtocolError::Framing(format!("short length read: {e}")))?;
    let len = u64::from_be_bytes(len_buf);
    if len > max_len {
        return Err(ProtocolError::Framing(format!(
            "frame length {len} exceeds limit"
        )));
    }
    let mut buf = vec![0u8; len as usize];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|e| ProtocolError::Framing(format!("short body read: {e}")))?;
    Ok(buf)
}

async fn write_length_prefixed<W: AsyncWrite + Unpin>(
    stream: &mut W,
    bytes: &[u8],
) -> Result<(), ProtocolError> {
    stream
        .write_all(&(bytes.len() as u64).to_be_bytes())
        .await
        .map_err(|e| ProtocolError::Framing(e.to_string()))?;
    stream
        .write_all(bytes)
        .await
        .map_err(|e| ProtocolError::Framing(e.to_string()))?;
    Ok(())
}

fn compress(data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| ProtocolError::Parse(format!("gzip compress: {e}")))?;
    encoder
        .finish()
        .map_err(|e| ProtocolError::Parse(format!("gzip compress: {e}")))
}

fn decompress(data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    use flate2::read::GzDecoder;
    use std::io::Read;

    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| ProtocolError::Parse(format!("gzip decompress: {e}")))?;
    Ok(out)
}
