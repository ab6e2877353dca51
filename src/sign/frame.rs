//! Command framing for the LED sign serial protocol.
//!
//! A scroll command is `!<direction>,<text>&`. Every payload travels as a
//! single line `@<payload>\r\n`, encoded as GBK because the sign firmware
//! does not understand UTF-8.

use std::str::FromStr;

use encoding_rs::{EncoderResult, GBK};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::SignError;

/// Encoded frame ready for the wire.
pub type Frame = SmallVec<[u8; 64]>;

/// Start of every line sent to the sign.
pub const LINE_START: &str = "@";
/// Line terminator expected by the sign.
pub const LINE_END: &str = "\r\n";

/// Substitute for characters GBK cannot represent.
const REPLACEMENT: u8 = b'?';

/// Scroll direction of the text on the sign.
#[derive(
   Debug,
   Default,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Direction {
   #[default]
   #[strum(serialize = "1", serialize = "left")]
   Left,
   #[strum(serialize = "2", serialize = "right")]
   Right,
}

impl Direction {
   /// Single-digit code used on the wire.
   pub const fn code(self) -> char {
      match self {
         Self::Left => '1',
         Self::Right => '2',
      }
   }

   /// Parses a direction, falling back to `default` for an empty selector.
   pub fn parse_or(s: &str, default: Self) -> Result<Self, SignError> {
      let s = s.trim();
      if s.is_empty() {
         return Ok(default);
      }
      Self::from_str(s).map_err(|_| SignError::InvalidDirection(s.to_owned()))
   }
}

/// Builds the scroll command for `text`.
///
/// Returns `None` for empty text; such input is never sent. The text is
/// not escaped, so an embedded `&` ends up verbatim on the wire.
pub fn compose(direction: Direction, text: &str) -> Option<String> {
   if text.is_empty() {
      return None;
   }
   Some(format!("!{},{text}&", direction.code()))
}

/// Wraps a payload into a protocol line.
pub fn frame_line(payload: &str) -> String {
   let mut line = String::with_capacity(payload.len() + LINE_START.len() + LINE_END.len());
   line.push_str(LINE_START);
   line.push_str(payload);
   line.push_str(LINE_END);
   line
}

/// Frames and encodes a payload for transmission.
pub fn encode_frame(payload: &str) -> Frame {
   Frame::from_vec(encode_gbk(&frame_line(payload)))
}

/// Encodes `text` as GBK, replacing unmappable characters with `?`.
pub fn encode_gbk(text: &str) -> Vec<u8> {
   let mut encoder = GBK.new_encoder();
   let mut out = Vec::with_capacity(text.len() * 2 + 4);
   let mut src = text;

   loop {
      let (result, read) = encoder.encode_from_utf8_to_vec_without_replacement(src, &mut out, true);
      src = &src[read..];
      match result {
         EncoderResult::InputEmpty => break,
         EncoderResult::OutputFull => out.reserve(src.len() * 2 + 4),
         EncoderResult::Unmappable(_) => out.push(REPLACEMENT),
      }
   }
   out
}
