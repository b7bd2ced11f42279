//! Message Model
//!
//! The broker-facing view of a wire message. Byte-level framing and parsing
//! live in the transport layer; the queue engine only sees `Message` values
//! with a target, headers, content bytes and control flags.

use bytes::Bytes;
use uuid::Uuid;

pub mod headers;

/// Errors that can occur when decoding a message block
#[derive(Debug)]
pub enum FrameError {
    /// Not enough data for the length prefix or payload
    Truncated,
    /// Payload failed to decode
    Decode(bincode::error::DecodeError),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Truncated => write!(f, "truncated message frame"),
            FrameError::Decode(e) => write!(f, "decode error: {}", e),
        }
    }
}

impl std::error::Error for FrameError {}

/// A wire message as consumed by the queue engine.
///
/// `id` may be empty for fire-and-forget traffic. Duplicate header keys are
/// permitted for multi-value semantics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Unique message identifier (empty allowed for fire-and-forget)
    pub id: String,
    /// Target queue or client name
    pub target: String,
    /// String-keyed headers, order irrelevant, duplicates permitted
    pub headers: Vec<(String, String)>,
    /// Message payload
    pub content: Bytes,
    /// Dequeue before regular messages
    pub high_priority: bool,
    /// Producer expects an acknowledgement
    pub wait_response: bool,
}

impl Message {
    pub fn new(target: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            id: String::new(),
            target: target.into(),
            headers: Vec::new(),
            content: content.into(),
            high_priority: false,
            wait_response: false,
        }
    }

    /// Assign a broker-generated id if the producer did not supply one
    pub fn ensure_id(&mut self) {
        if self.id.is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
    }

    /// First header value with the given name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    /// Build a response correlated to this message by id
    pub fn new_response(&self, content: impl Into<Bytes>) -> Message {
        let mut response = Message::new(self.target.clone(), content);
        if !self.id.is_empty() {
            response.add_header(headers::REQUEST_ID, self.id.clone());
        }
        response
    }
}

impl bincode::Encode for Message {
    fn encode<E: bincode::enc::Encoder>(
        &self,
        encoder: &mut E,
    ) -> Result<(), bincode::error::EncodeError> {
        self.id.encode(encoder)?;
        self.target.encode(encoder)?;
        self.headers.encode(encoder)?;
        self.content.as_ref().encode(encoder)?;
        self.high_priority.encode(encoder)?;
        self.wait_response.encode(encoder)
    }
}

impl<Context> bincode::Decode<Context> for Message {
    fn decode<D: bincode::de::Decoder<Context = Context>>(
        decoder: &mut D,
    ) -> Result<Self, bincode::error::DecodeError> {
        Ok(Self {
            id: String::decode(decoder)?,
            target: String::decode(decoder)?,
            headers: Vec::decode(decoder)?,
            content: Bytes::from(Vec::<u8>::decode(decoder)?),
            high_priority: bool::decode(decoder)?,
            wait_response: bool::decode(decoder)?,
        })
    }
}

impl Message {
    /// Serialize to wire bytes for a consumer send or a sync payload
    pub fn to_bytes(&self) -> Result<Bytes, bincode::error::EncodeError> {
        bincode::encode_to_vec(self, bincode::config::standard()).map(Bytes::from)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        bincode::decode_from_slice(data, bincode::config::standard()).map(|(msg, _)| msg)
    }
}

/// Append a length-prefixed message frame to a block
pub fn write_frame(block: &mut Vec<u8>, msg: &Message) -> Result<(), bincode::error::EncodeError> {
    let payload = bincode::encode_to_vec(msg, bincode::config::standard())?;
    block.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    block.extend_from_slice(&payload);
    Ok(())
}

/// Decode a block of concatenated length-prefixed message frames
pub fn read_frames(mut block: &[u8]) -> Result<Vec<Message>, FrameError> {
    let mut messages = Vec::new();
    while !block.is_empty() {
        if block.len() < 4 {
            return Err(FrameError::Truncated);
        }
        let len = u32::from_be_bytes([block[0], block[1], block[2], block[3]]) as usize;
        block = &block[4..];
        if block.len() < len {
            return Err(FrameError::Truncated);
        }
        let msg = Message::from_bytes(&block[..len]).map_err(FrameError::Decode)?;
        messages.push(msg);
        block = &block[len..];
    }
    Ok(messages)
}
