//! TCP stream framing.
//!
//! ```text
//! ┌────────────────┬──────────────────────────────────┐
//! │ Len (4, LE)    │ postcard(Message) (Len bytes)    │
//! └────────────────┴──────────────────────────────────┘
//! ```
//!
//! Application messages pass through untouched. A message carrying the
//! reserved [`KEEPALIVE_FIELD`] is connector traffic: `true` asks the other
//! side to answer, `false` is the answer. Neither is surfaced to the owner.

use crate::message::{Message, WireError};

pub const LEN_PREFIX: usize = 4;

/// Frames larger than this poison the stream.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Reserved boolean marking keep-alive traffic.
pub const KEEPALIVE_FIELD: &str = "_ka";

/// `what` code used for keep-alive messages.
pub const KEEPALIVE_WHAT: u32 = 0x5f6b_6120;

#[must_use]
pub fn keepalive_ping() -> Message {
    Message::new(KEEPALIVE_WHAT).with(KEEPALIVE_FIELD, true)
}

#[must_use]
pub fn keepalive_reply() -> Message {
    Message::new(KEEPALIVE_WHAT).with(KEEPALIVE_FIELD, false)
}

/// Classification of a received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keepalive {
    /// Ordinary application message.
    None,
    /// Peer wants an answer.
    Ping,
    /// Answer to our ping.
    Reply,
}

#[must_use]
pub fn classify(msg: &Message) -> Keepalive {
    match msg.get_bool(KEEPALIVE_FIELD) {
        Some(true) => Keepalive::Ping,
        Some(false) => Keepalive::Reply,
        None => Keepalive::None,
    }
}

/// Appends one length-prefixed frame to `out`.
///
/// # Errors
///
/// Returns [`WireError`] if encoding fails or the frame is too large.
pub fn encode_frame(msg: &Message, out: &mut Vec<u8>) -> Result<(), WireError> {
    let body = postcard::to_stdvec(msg)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            len: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(())
}

/// Reassembles frames from arbitrary stream chunks.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pops the next complete frame, if one is buffered.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] on an oversized or undecodable frame; the
    /// stream cannot be resynchronised after that.
    pub fn next_frame(&mut self) -> Result<Option<Message>, WireError> {
        let Some(prefix) = self.buf.get(..LEN_PREFIX) else {
            return Ok(None);
        };
        let len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge {
                len,
                max: MAX_FRAME_SIZE,
            });
        }
        if self.buf.len() < LEN_PREFIX + len {
            return Ok(None);
        }
        let msg = Message::decode(&self.buf[LEN_PREFIX..LEN_PREFIX + len]);
        self.buf.drain(..LEN_PREFIX + len);
        msg.map(Some)
    }

    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}
