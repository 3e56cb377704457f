//! Framed codec for the worker side of a channel.
//!
//! Frames are `payload || MSG_DELIM`; payloads are key/value vectors.
//! Works over any AsyncRead/AsyncWrite (the worker uses its stdin/stdout).

use std::io;

use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::kvvec::{self, KvVec, Ownership};
use super::protocol::{KEY_SEP, MSG_DELIM, PAIR_SEP};
use crate::iocache::{MAX_CACHE_SIZE, find_subsequence};

/// Codec that splits on [`MSG_DELIM`] and decodes each payload into an
/// owned [`KvVec`].
///
/// Malformed payloads are logged and skipped; the stream continues with the
/// next frame.
pub struct KvFrameCodec {
    /// Bytes already scanned without finding a delimiter.
    next_index: usize,
    max_frame: usize,
}

impl Default for KvFrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl KvFrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame(MAX_CACHE_SIZE)
    }

    pub fn with_max_frame(max_frame: usize) -> Self {
        Self {
            next_index: 0,
            max_frame,
        }
    }
}

impl Decoder for KvFrameCodec {
    type Item = KvVec<'static>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            // Back up so a delimiter split across reads is still found.
            let start = self.next_index.saturating_sub(MSG_DELIM.len() - 1);
            let Some(offset) = find_subsequence(&src[start..], MSG_DELIM) else {
                if src.len() > self.max_frame {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("frame exceeds {} bytes without delimiter", self.max_frame),
                    ));
                }
                self.next_index = src.len();
                return Ok(None);
            };
            self.next_index = 0;

            let frame = src.split_to(start + offset);
            src.advance(MSG_DELIM.len());

            match kvvec::decode(&frame, KEY_SEP, PAIR_SEP, Ownership::Copy) {
                Ok(kvv) => return Ok(Some(kvv.into_owned())),
                Err(e) => {
                    tracing::warn!(error = %e, frame_len = frame.len(), "Skipping malformed frame");
                }
            }
        }
    }
}

impl Encoder<KvVec<'_>> for KvFrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: KvVec<'_>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = kvvec::encode(&item, KEY_SEP, PAIR_SEP)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(payload_bytes = payload.len(), "Encoding frame");
        dst.reserve(payload.len() + MSG_DELIM.len());
        dst.extend_from_slice(&payload);
        dst.extend_from_slice(MSG_DELIM);
        Ok(())
    }
}
