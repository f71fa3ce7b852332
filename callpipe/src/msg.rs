use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{Error, ErrorKind, Result, Status, StatusCode};

pub const MAGIC_NUM: u32 = u32::from_be_bytes(*b"CPIP");
pub const MAX_MSG_SIZE: usize = 64 << 20;
const HEADER_SIZE: usize = std::mem::size_of::<u64>();

#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub enum MetadataValue {
    Text(String),
    Binary(Vec<u8>),
}

impl MetadataValue {
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MetadataValue::Text(text) => Some(text),
            MetadataValue::Binary(_) => None,
        }
    }
}

/// Ordered key/value pairs sent as request headers or response trailers.
///
/// Keys are compared case-insensitively and stored lowercased. A key may
/// appear more than once; insertion order is preserved on the wire.
#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq, Clone)]
#[serde(transparent)]
pub struct Metadata(Vec<(String, MetadataValue)>);

impl Metadata {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.push(key.into(), MetadataValue::Text(value.into()));
    }

    pub fn insert_bin(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.push(key.into(), MetadataValue::Binary(value.into()));
    }

    fn push(&mut self, mut key: String, value: MetadataValue) {
        key.make_ascii_lowercase();
        self.0.push((key, value));
    }

    /// First value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    #[must_use]
    pub fn get_text(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(MetadataValue::as_text)
    }

    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a MetadataValue> + 'a {
        self.0
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// First frame of every connection: which method to run and under which deadline.
#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq, Clone)]
pub struct CallRequest {
    pub method: String,
    /// Absolute deadline in milliseconds since the unix epoch, 0 for none.
    #[serde(default)]
    pub deadline_unix_ms: u64,
    #[serde(default)]
    pub headers: Option<Metadata>,
}

impl CallRequest {
    #[must_use]
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: SystemTime) -> Self {
        let ms = deadline
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        // 0 means "no deadline", an already expired one must stay a deadline.
        self.deadline_unix_ms = ms.max(1);
        self
    }

    #[must_use]
    pub fn with_headers(mut self, headers: Metadata) -> Self {
        self.headers = (!headers.is_empty()).then_some(headers);
        self
    }

    #[must_use]
    pub fn deadline(&self) -> Option<SystemTime> {
        if self.deadline_unix_ms == 0 {
            None
        } else {
            UNIX_EPOCH.checked_add(Duration::from_millis(self.deadline_unix_ms))
        }
    }
}

/// Control frame exchanged once the call is running.
///
/// `RequestData` and `ResponseData` are always followed by exactly one blob frame.
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub enum Envelope {
    RequestData,
    RequestComplete,
    RequestCancel,
    ResponseData,
    ResponseComplete(ResponseComplete),
}

#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq, Clone)]
pub struct ResponseComplete {
    pub status_code: i32,
    pub status_detail: String,
    #[serde(default)]
    pub trailers: Option<Metadata>,
}

impl ResponseComplete {
    #[must_use]
    pub fn new(status: &Status, trailers: Metadata) -> Self {
        Self {
            status_code: status.code.as_i32(),
            status_detail: status.detail.clone(),
            trailers: (!trailers.is_empty()).then_some(trailers),
        }
    }

    #[must_use]
    pub fn status(&self) -> Status {
        Status::new(StatusCode::from_i32(self.status_code), self.status_detail.clone())
    }
}

/// Accumulates one or more complete frames so they can be written in one go.
///
/// Frame layout:
///
/// ```text
/// | 4 bytes   | 4 bytes  | len bytes |
/// | MAGIC_NUM | len (BE) | body      |
/// ```
#[derive(Debug, Default)]
pub struct FrameBuilder {
    buffer: BytesMut,
}

impl FrameBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a control frame whose body is `value` as named MessagePack.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails or the frame is too long.
    pub fn control<T: Serialize>(&mut self, value: &T) -> Result<&mut Self> {
        let start = self.begin_frame();
        if let Err(e) = rmp_serde::encode::write_named(&mut (&mut self.buffer).writer(), value) {
            self.buffer.truncate(start);
            return Err(e.into());
        }
        self.finish_frame(start)?;
        Ok(self)
    }

    /// Appends a blob frame carrying `blob` verbatim.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is too long.
    pub fn blob(&mut self, blob: &[u8]) -> Result<&mut Self> {
        let start = self.begin_frame();
        self.buffer.extend_from_slice(blob);
        self.finish_frame(start)?;
        Ok(self)
    }

    fn begin_frame(&mut self) -> usize {
        let start = self.buffer.len();
        self.buffer.put_u32(MAGIC_NUM);
        self.buffer.put_u32(0);
        start
    }

    fn finish_frame(&mut self, start: usize) -> Result<()> {
        let len = self.buffer.len() - start - HEADER_SIZE;
        if HEADER_SIZE + len >= MAX_MSG_SIZE {
            self.buffer.truncate(start);
            return Err(Error::new(
                ErrorKind::ProtocolError,
                format!("msg is too long: {len}"),
            ));
        }
        let len = u32::try_from(len)?;
        self.buffer[start + 4..start + HEADER_SIZE].copy_from_slice(&len.to_be_bytes());
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    #[must_use]
    pub fn finish(self) -> Bytes {
        self.buffer.freeze()
    }
}

/// Splits the next complete frame body off `buffer`.
///
/// Returns `Ok(None)` while the frame is still incomplete.
///
/// # Errors
///
/// Returns `ProtocolError` on a bad magic number or an oversized frame.
pub fn parse_frame(buffer: &mut BytesMut) -> Result<Option<Bytes>> {
    if buffer.len() < HEADER_SIZE {
        return Ok(None);
    }
    let header = (&buffer[..HEADER_SIZE]).get_u64();
    if (header >> 32) as u32 != MAGIC_NUM {
        return Err(Error::new(
            ErrorKind::ProtocolError,
            format!("invalid header: {header:016X}"),
        ));
    }

    let len = usize::try_from(header & u64::from(u32::MAX))?;
    if HEADER_SIZE + len >= MAX_MSG_SIZE {
        return Err(Error::new(
            ErrorKind::ProtocolError,
            format!("msg is too long: {len}"),
        ));
    }

    if buffer.len() < HEADER_SIZE + len {
        Ok(None)
    } else {
        buffer.advance(HEADER_SIZE);
        Ok(Some(buffer.split_to(len).freeze()))
    }
}
