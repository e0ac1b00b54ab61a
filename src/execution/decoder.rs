//! Incremental UTF-8 decoding of transport chunks
//!
//! Transports hand out output at arbitrary byte boundaries, so a multi-byte
//! character may be split across two reads. Each stream owns one
//! [`ChunkDecoder`] that carries the undecoded tail of the previous chunk
//! into the next call.

use super::types::RawChunk;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const REPLACEMENT: char = '\u{FFFD}';

/// What to do with byte sequences that are not valid UTF-8
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodePolicy {
    /// Fail the command
    Strict,
    /// Substitute U+FFFD for each invalid sequence
    #[default]
    Replace,
    /// Drop invalid sequences
    Ignore,
}

impl fmt::Display for DecodePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodePolicy::Strict => f.write_str("strict"),
            DecodePolicy::Replace => f.write_str("replace"),
            DecodePolicy::Ignore => f.write_str("ignore"),
        }
    }
}

impl FromStr for DecodePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(DecodePolicy::Strict),
            "replace" => Ok(DecodePolicy::Replace),
            "ignore" => Ok(DecodePolicy::Ignore),
            other => Err(format!(
                "unknown encoding error policy '{other}' (expected strict, replace or ignore)"
            )),
        }
    }
}

/// An invalid byte sequence under [`DecodePolicy::Strict`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid UTF-8 sequence {bytes:02x?} at byte offset {offset}")]
pub struct DecodeError {
    /// Offset into `carry + raw` where the invalid sequence starts
    pub offset: usize,
    pub bytes: Vec<u8>,
}

/// Decode `carry + raw` into text.
///
/// Returns the decoded text and the trailing bytes of an incomplete
/// multi-byte sequence, which are left out of the text and must be passed
/// back as `carry` with the next chunk of the same stream.
pub fn decode(
    raw: &[u8],
    carry: &[u8],
    policy: DecodePolicy,
) -> Result<(String, Vec<u8>), DecodeError> {
    let joined;
    let mut input: &[u8] = if carry.is_empty() {
        raw
    } else {
        joined = [carry, raw].concat();
        &joined
    };

    let mut text = String::with_capacity(input.len());
    let mut consumed = 0;

    loop {
        match std::str::from_utf8(input) {
            Ok(valid) => {
                text.push_str(valid);
                return Ok((text, Vec::new()));
            }
            Err(err) => {
                let (valid, rest) = input.split_at(err.valid_up_to());
                // `valid_up_to` marks a verified UTF-8 prefix
                text.push_str(std::str::from_utf8(valid).unwrap_or_default());
                consumed += valid.len();

                match err.error_len() {
                    // Incomplete sequence at the end of input
                    None => return Ok((text, rest.to_vec())),
                    Some(len) => {
                        match policy {
                            DecodePolicy::Strict => {
                                return Err(DecodeError {
                                    offset: consumed,
                                    bytes: rest[..len].to_vec(),
                                })
                            }
                            DecodePolicy::Replace => text.push(REPLACEMENT),
                            DecodePolicy::Ignore => {}
                        }
                        consumed += len;
                        input = &rest[len..];
                    }
                }
            }
        }
    }
}

/// Per-stream decoder holding the carry-over state between chunks
#[derive(Debug, Clone, Default)]
pub struct ChunkDecoder {
    policy: DecodePolicy,
    carry: Vec<u8>,
}

impl ChunkDecoder {
    pub fn new(policy: DecodePolicy) -> Self {
        Self {
            policy,
            carry: Vec::new(),
        }
    }

    pub fn policy(&self) -> DecodePolicy {
        self.policy
    }

    /// Bytes held back from the last chunk
    pub fn pending(&self) -> &[u8] {
        &self.carry
    }

    /// Decode the next chunk of this stream.
    ///
    /// Text chunks are passed through; any bytes still carried from an
    /// earlier byte chunk are flushed in front of them first.
    pub fn push(&mut self, chunk: RawChunk) -> Result<String, DecodeError> {
        match chunk {
            RawChunk::Bytes(bytes) => {
                let (text, carry) = decode(&bytes, &self.carry, self.policy)?;
                self.carry = carry;
                Ok(text)
            }
            RawChunk::Text(text) => {
                let mut flushed = self.finish()?;
                flushed.push_str(&text);
                Ok(flushed)
            }
        }
    }

    /// Flush the carry at end of stream.
    ///
    /// A sequence still incomplete here is truncated and therefore invalid.
    pub fn finish(&mut self) -> Result<String, DecodeError> {
        if self.carry.is_empty() {
            return Ok(String::new());
        }
        let carry = std::mem::take(&mut self.carry);
        match self.policy {
            DecodePolicy::Strict => Err(DecodeError {
                offset: 0,
                bytes: carry,
            }),
            DecodePolicy::Replace => Ok(REPLACEMENT.to_string()),
            DecodePolicy::Ignore => Ok(String::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn bytes(data: &[u8]) -> RawChunk {
        RawChunk::Bytes(Bytes::copy_from_slice(data))
    }

    #[test]
    fn test_plain_ascii() {
        let (text, carry) = decode(b"hello", b"", DecodePolicy::Strict).unwrap();
        assert_eq!(text, "hello");
        assert!(carry.is_empty());
    }

    #[test]
    fn test_split_character_at_every_boundary() {
        // 4-byte, 3-byte and 2-byte characters
        for sample in ["a😀b", "x€y", "é"] {
            let encoded = sample.as_bytes();
            for split in 0..=encoded.len() {
                let mut decoder = ChunkDecoder::new(DecodePolicy::Strict);
                let first = decoder.push(bytes(&encoded[..split])).unwrap();
                let second = decoder.push(bytes(&encoded[split..])).unwrap();
                assert_eq!(format!("{first}{second}"), sample, "split at {split}");
                assert!(decoder.pending().is_empty());
                // Never a fragment: both halves are complete characters
                assert!(sample.starts_with(&first));
            }
        }
    }

    #[test]
    fn test_split_emoji_byte_by_byte() {
        let mut decoder = ChunkDecoder::new(DecodePolicy::Strict);
        let encoded = "😀".as_bytes();
        let mut outputs = Vec::new();
        for byte in encoded {
            outputs.push(decoder.push(bytes(&[*byte])).unwrap());
        }
        assert_eq!(outputs, vec!["", "", "", "😀"]);
    }

    #[test]
    fn test_strict_rejects_invalid_bytes() {
        let err = decode(b"ok\xffmore", b"", DecodePolicy::Strict).unwrap_err();
        assert_eq!(err.offset, 2);
        assert_eq!(err.bytes, vec![0xff]);
    }

    #[test]
    fn test_replace_substitutes_invalid_bytes() {
        let (text, carry) = decode(b"ok\xffmore\xfe", b"", DecodePolicy::Replace).unwrap();
        assert_eq!(text, "ok\u{FFFD}more\u{FFFD}");
        assert!(carry.is_empty());
    }

    #[test]
    fn test_ignore_drops_invalid_bytes() {
        let (text, _) = decode(b"a\xc3\x28b", b"", DecodePolicy::Ignore).unwrap();
        assert_eq!(text, "a(b");
    }

    #[test]
    fn test_incomplete_tail_becomes_carry_for_every_policy() {
        for policy in [
            DecodePolicy::Strict,
            DecodePolicy::Replace,
            DecodePolicy::Ignore,
        ] {
            let (text, carry) = decode(b"ab\xe2\x82", b"", policy).unwrap();
            assert_eq!(text, "ab");
            assert_eq!(carry, vec![0xe2, 0x82]);
        }
    }

    #[test]
    fn test_finish_flushes_truncated_sequence() {
        let mut strict = ChunkDecoder::new(DecodePolicy::Strict);
        strict.push(bytes(b"\xe2\x82")).unwrap();
        assert!(strict.finish().is_err());

        let mut replace = ChunkDecoder::new(DecodePolicy::Replace);
        replace.push(bytes(b"\xe2\x82")).unwrap();
        assert_eq!(replace.finish().unwrap(), "\u{FFFD}");

        let mut ignore = ChunkDecoder::new(DecodePolicy::Ignore);
        ignore.push(bytes(b"\xe2\x82")).unwrap();
        assert_eq!(ignore.finish().unwrap(), "");
    }

    #[test]
    fn test_text_chunks_pass_through() {
        let mut decoder = ChunkDecoder::new(DecodePolicy::Strict);
        assert_eq!(
            decoder.push(RawChunk::Text("string_out".into())).unwrap(),
            "string_out"
        );
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("STRICT".parse::<DecodePolicy>(), Ok(DecodePolicy::Strict));
        assert_eq!("ignore".parse::<DecodePolicy>(), Ok(DecodePolicy::Ignore));
        assert!("lenient".parse::<DecodePolicy>().is_err());
    }
}
