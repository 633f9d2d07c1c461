//! Consistent Overhead Byte Stuffing codec.
//!
//! Frames on the wire are COBS-stuffed so the payload contains no zero
//! byte, then terminated with a literal `0x00`. This module provides the
//! incremental encoder/decoder state machines, buffer-level helpers, and
//! [`CobsCodec`], a [`tokio_util::codec`] codec for use with `Framed`.
//!
//! ```text
//! +----------------------------+------+
//! | COBS(payload)              | 0x00 |
//! +----------------------------+------+
//! ```
//!
//! # Invariants
//!
//! - An encoded frame body never contains `0x00`.
//! - `decode(encode(s)) == s` for every payload up to the frame bound.
//! - A run of 254 non-zero bytes closes with an `0xFF` overhead byte and
//!   consumes no input zero.
//! - Worst-case encoded size is `len + len / 254 + 1` bytes before the
//!   delimiter.
//!
//! The decoder bound is checked before buffering more input: a peer that
//! streams an unterminated frame past the limit gets a codec error, which
//! drops the connection rather than the process.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Default bound on a decoded frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Errors produced by COBS encoding, decoding, and framing.
#[derive(Debug, thiserror::Error)]
pub enum CobsError {
    /// A zero byte appeared inside a stuffed frame body.
    #[error("unexpected zero byte inside a stuffed frame")]
    ZeroByte,

    /// The frame delimiter arrived before the current run completed.
    #[error("frame truncated mid-run")]
    Truncated,

    /// A decoded frame would exceed the configured bound.
    #[error("decoded frame exceeds {max} bytes")]
    FrameTooLarge {
        /// Configured frame bound.
        max: usize,
    },

    /// An outbound payload exceeds the configured bound.
    #[error("payload of {size} bytes exceeds frame bound of {max}")]
    PayloadTooLarge {
        /// Offending payload size.
        size: usize,
        /// Configured frame bound.
        max: usize,
    },

    /// Transport-level I/O failure surfaced through the codec.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Worst-case stuffed size for a payload of `len` bytes (delimiter
/// excluded).
#[must_use]
pub const fn max_encoded_len(len: usize) -> usize {
    len + len / 254 + 1
}

/// Streaming COBS encoder writing into a caller-provided buffer.
///
/// The encoder back-patches the overhead byte of the current run, so the
/// output buffer must not be touched between [`push`](Self::push) calls
/// and [`finish`](Self::finish). The delimiter is not written; framing
/// appends it.
#[derive(Debug)]
pub struct CobsEncoder<'a> {
    out: &'a mut BytesMut,
    mark: usize,
    run: u8,
}

impl<'a> CobsEncoder<'a> {
    /// Start a frame, reserving the first overhead slot.
    pub fn new(out: &'a mut BytesMut) -> Self {
        let mark = out.len();
        out.put_u8(0);
        Self { out, mark, run: 1 }
    }

    /// Feed one payload byte.
    pub fn push(&mut self, b: u8) {
        if b == 0 {
            self.out[self.mark] = self.run;
            self.open_run();
            return;
        }
        self.out.put_u8(b);
        self.run += 1;
        if self.run == 0xFF {
            // Maximum-length run: close with 0xFF, no zero consumed.
            self.out[self.mark] = 0xFF;
            self.open_run();
        }
    }

    /// Close the final run. The frame body is complete afterwards.
    pub fn finish(self) {
        self.out[self.mark] = self.run;
    }

    fn open_run(&mut self) {
        self.mark = self.out.len();
        self.out.put_u8(0);
        self.run = 1;
    }
}

/// Streaming COBS decoder.
///
/// `offset == 1` means the next input byte is an overhead byte. The zero
/// implied by a completed run is emitted when the following overhead byte
/// arrives (unless the previous overhead was `0xFF`), which is exactly
/// what keeps the trailing zero off the decoded payload.
#[derive(Debug, Clone, Copy)]
pub struct CobsDecoder {
    offset: u8,
    pending_zero: bool,
}

impl CobsDecoder {
    /// Decoder positioned before the first overhead byte.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            offset: 1,
            pending_zero: false,
        }
    }

    /// Feed one stuffed byte; yields at most one payload byte.
    ///
    /// # Errors
    ///
    /// [`CobsError::ZeroByte`] if a zero appears in the frame body.
    pub fn feed(&mut self, b: u8) -> Result<Option<u8>, CobsError> {
        if b == 0 {
            return Err(CobsError::ZeroByte);
        }
        if self.offset == 1 {
            let out = if self.pending_zero { Some(0) } else { None };
            self.pending_zero = b != 0xFF;
            self.offset = b;
            return Ok(out);
        }
        self.offset -= 1;
        Ok(Some(b))
    }

    /// Whether the decoder sits at a run boundary, i.e. the frame may end
    /// here without truncation.
    #[must_use]
    pub const fn at_boundary(&self) -> bool {
        self.offset == 1
    }
}

impl Default for CobsDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Stuff `src` into `out` (delimiter excluded).
pub fn encode_cobs(src: &[u8], out: &mut BytesMut) {
    let mut enc = CobsEncoder::new(out);
    for &b in src {
        enc.push(b);
    }
    enc.finish();
}

/// Unstuff a complete frame body (delimiter already stripped).
///
/// # Errors
///
/// [`CobsError::ZeroByte`] on an embedded zero, [`CobsError::Truncated`]
/// when the body ends mid-run, [`CobsError::FrameTooLarge`] when the
/// decoded payload would exceed `max_len`.
pub fn decode_cobs(src: &[u8], max_len: usize) -> Result<Vec<u8>, CobsError> {
    let mut out = Vec::with_capacity(src.len().min(max_len));
    let mut dec = CobsDecoder::new();
    for &b in src {
        if let Some(v) = dec.feed(b)? {
            if out.len() >= max_len {
                return Err(CobsError::FrameTooLarge { max: max_len });
            }
            out.push(v);
        }
    }
    if !dec.at_boundary() {
        return Err(CobsError::Truncated);
    }
    Ok(out)
}

/// Zero-delimited COBS frame codec for [`tokio_util::codec::Framed`].
#[derive(Debug, Clone)]
pub struct CobsCodec {
    max_frame_size: usize,
}

impl CobsCodec {
    /// Codec with the default frame bound.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Codec with a custom frame bound (decoded payload bytes).
    #[must_use]
    pub const fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Configured frame bound.
    #[must_use]
    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for CobsCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for CobsCodec {
    type Item = Bytes;
    type Error = CobsError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, CobsError> {
        loop {
            let Some(pos) = src.iter().position(|&b| b == 0) else {
                // No delimiter yet. Refuse to buffer more than one
                // maximally-stuffed frame.
                if src.len() > max_encoded_len(self.max_frame_size) {
                    return Err(CobsError::FrameTooLarge {
                        max: self.max_frame_size,
                    });
                }
                return Ok(None);
            };
            let frame = src.split_to(pos);
            src.advance(1);
            if frame.is_empty() {
                // Stray delimiter between frames; keep scanning.
                continue;
            }
            let decoded = decode_cobs(&frame, self.max_frame_size)?;
            return Ok(Some(Bytes::from(decoded)));
        }
    }
}

impl Encoder<&[u8]> for CobsCodec {
    type Error = CobsError;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<(), CobsError> {
        if item.len() > self.max_frame_size {
            return Err(CobsError::PayloadTooLarge {
                size: item.len(),
                max: self.max_frame_size,
            });
        }
        dst.reserve(max_encoded_len(item.len()) + 1);
        encode_cobs(item, dst);
        dst.put_u8(0);
        Ok(())
    }
}

impl Encoder<Bytes> for CobsCodec {
    type Error = CobsError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), CobsError> {
        self.encode(&item[..], dst)
    }
}

impl Encoder<Vec<u8>> for CobsCodec {
    type Error = CobsError;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<(), CobsError> {
        self.encode(item.as_slice(), dst)
    }
}
