//! Binary message layout.
//!
//! ```text
//! typeCode:      i32
//! messageClass:  i32   (1 = command, 2 = response, 3 = sync)
//! timestamp:     i64
//! senderIdLen:   i32   senderId: [u8]
//! ── command ──  sessionIdLen:i32 sessionId  paramCount:i32  { len:i32 bytes }*
//! ── response ─  statusCode:i32  messageLen:i32 message  dataCount:i32  { len:i32 bytes }*
//! ── sync ─────  origin:i64  receive:i64  transmit:i64
//! ```
//!
//! All integers are big-endian, all strings UTF-8. Decoding never panics:
//! every length is checked against both a sanity bound and the bytes
//! actually remaining.

use bytes::{BufMut, BytesMut};

use crate::error::DecodeError;
use crate::message::{CommandType, MessageClass, StatusCode};
use crate::protocol::{CommandMessage, Message, ResponseMessage, SyncMessage};

/// Size of the fixed prefix: type code, class and timestamp.
pub const HEADER_SIZE: usize = 16;

/// Upper bound for identity strings (sender id, session id).
pub const MAX_ID_LEN: usize = 1024;

/// Upper bound for any other single string field.
pub const MAX_FIELD_LEN: usize = 64 * 1024;

/// Upper bound for the number of parameters / data items.
pub const MAX_ITEMS: usize = 4096;

// ── Encoding ─────────────────────────────────────────────────────

/// Serialize a message. Total for any in-memory message.
pub fn encode(message: &Message) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(encoded_len(message));
    encode_into(message, &mut buf);
    buf.to_vec()
}

/// Serialize a message onto the end of `dst`.
pub fn encode_into(message: &Message, dst: &mut BytesMut) {
    dst.reserve(encoded_len(message));
    dst.put_i32(message.kind().code());
    dst.put_i32(message.class() as i32);
    dst.put_i64(message.timestamp());
    put_str(dst, message.sender_id());

    match message {
        Message::Command(m) => {
            put_str(dst, &m.session_id);
            put_list(dst, &m.parameters);
        }
        Message::Response(m) => {
            dst.put_i32(m.status.code());
            put_str(dst, &m.message);
            put_list(dst, &m.data);
        }
        Message::Sync(m) => {
            dst.put_i64(m.origin_timestamp);
            dst.put_i64(m.receive_timestamp);
            dst.put_i64(m.transmit_timestamp);
        }
    }
}

/// Exact encoded size of `message`.
pub fn encoded_len(message: &Message) -> usize {
    let head = HEADER_SIZE + 4 + message.sender_id().len();
    let body = match message {
        Message::Command(m) => 4 + m.session_id.len() + list_len(&m.parameters),
        Message::Response(m) => 4 + 4 + m.message.len() + list_len(&m.data),
        Message::Sync(_) => 24,
    };
    head + body
}

fn list_len(items: &[String]) -> usize {
    4 + items.iter().map(|s| 4 + s.len()).sum::<usize>()
}

fn put_str(dst: &mut BytesMut, s: &str) {
    dst.put_i32(s.len() as i32);
    dst.put_slice(s.as_bytes());
}

fn put_list(dst: &mut BytesMut, items: &[String]) {
    dst.put_i32(items.len() as i32);
    for item in items {
        put_str(dst, item);
    }
}

// ── Decoding ─────────────────────────────────────────────────────

/// Parse one complete message. The buffer must contain exactly one message.
pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
    if bytes.len() < HEADER_SIZE {
        return Err(DecodeError::Malformed("buffer shorter than header"));
    }

    let mut r = Reader::new(bytes);
    let type_code = r.i32()?;
    let class_code = r.i32()?;
    let timestamp = r.i64()?;
    let sender_id = r.string(MAX_ID_LEN, "sender id length")?;

    let class = MessageClass::try_from(class_code)?;
    let kind = CommandType::try_from(type_code)?;

    let message = match class {
        MessageClass::Command => {
            let session_id = r.string(MAX_ID_LEN, "session id length")?;
            let parameters = r.list("parameter")?;
            Message::Command(CommandMessage::new(
                kind, sender_id, timestamp, session_id, parameters,
            ))
        }
        MessageClass::Response => {
            let status = StatusCode::from_code(r.i32()?);
            let text = r.string(MAX_FIELD_LEN, "response text length")?;
            let data = r.list("data item")?;
            Message::Response(ResponseMessage::new(
                kind, sender_id, timestamp, status, text, data,
            ))
        }
        MessageClass::Sync => {
            let origin = r.i64()?;
            let receive = r.i64()?;
            let transmit = r.i64()?;
            Message::Sync(SyncMessage::new(
                kind, sender_id, timestamp, origin, receive, transmit,
            ))
        }
    };

    if r.remaining() != 0 {
        return Err(DecodeError::Malformed("trailing bytes after message"));
    }
    Ok(message)
}

/// Bounds-checked big-endian cursor.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() < n {
            return Err(DecodeError::Malformed("truncated message"));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(i32::from_be_bytes(raw))
    }

    fn i64(&mut self) -> Result<i64, DecodeError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(i64::from_be_bytes(raw))
    }

    fn length(&mut self, max: usize, what: &'static str) -> Result<usize, DecodeError> {
        let len = self.i32()?;
        if len < 0 || len as usize > max {
            return Err(DecodeError::Malformed(what));
        }
        Ok(len as usize)
    }

    fn string(&mut self, max: usize, what: &'static str) -> Result<String, DecodeError> {
        let len = self.length(max, what)?;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::Malformed("invalid utf-8"))
    }

    fn list(&mut self, what: &'static str) -> Result<Vec<String>, DecodeError> {
        let count = self.length(MAX_ITEMS, "item count")?;
        // Each item needs at least its 4-byte length prefix.
        if count * 4 > self.remaining() {
            return Err(DecodeError::Malformed("item count exceeds buffer"));
        }
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(self.string(MAX_FIELD_LEN, what)?);
        }
        Ok(items)
    }
}
