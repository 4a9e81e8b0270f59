//! MJPEG demultiplexing: split a continuous byte stream into JPEG images and
//! decode them into rasters.

use bytes::{Buf, BytesMut};
use jpeg_decoder::Decoder;
use tracing::{debug, warn};

use super::frame::{Frame, Raster};

/// JPEG start-of-image marker
pub const SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker
pub const EOI: [u8; 2] = [0xFF, 0xD9];

/// Encoded images shorter than this are treated as corrupt.
pub const DEFAULT_MIN_FRAME_BYTES: usize = 100;

/// Outcome of one decode attempt over an accumulation buffer.
#[derive(Debug)]
pub enum Decoded {
    /// A frame was decoded; `consumed` bytes of the buffer are spent.
    Frame { raster: Raster, consumed: usize },
    /// A marker pair was found but its payload was undersized or would not
    /// decode. The pair is still consumed.
    Skipped { consumed: usize, reason: SkipReason },
    /// No complete marker pair yet; keep accumulating.
    Incomplete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Undersized(usize),
    Corrupt(String),
}

fn find(haystack: &[u8], needle: &[u8; 2], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(2)
        .position(|w| w == needle)
        .map(|pos| pos + from)
}

/// Locate the first complete `SOI .. EOI` pair. Returns `(start, end)` where
/// `end` is one past the end marker.
pub fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = find(buffer, &SOI, 0)?;
    let end = find(buffer, &EOI, start + SOI.len())?;
    Some((start, end + EOI.len()))
}

/// Decode one JPEG image into a raster.
pub fn decode_jpeg(data: &[u8]) -> Result<Raster, jpeg_decoder::Error> {
    let mut decoder = Decoder::new(data);
    let pixels = decoder.decode()?;
    let info = decoder
        .info()
        .ok_or_else(|| jpeg_decoder::Error::Format("missing image info".into()))?;

    Ok(Raster {
        pixels,
        width: u32::from(info.width),
        height: u32::from(info.height),
        format: info.pixel_format.into(),
        encoded_len: data.len(),
    })
}

/// Try to take one frame off the front of `buffer`.
///
/// Never fails: malformed payloads come back as [`Decoded::Skipped`] so a
/// single corrupt image cannot stall the pipeline.
pub fn decode(buffer: &[u8], min_frame_bytes: usize) -> Decoded {
    let Some((start, end)) = find_jpeg_bounds(buffer) else {
        return Decoded::Incomplete;
    };

    let jpeg = &buffer[start..end];
    if jpeg.len() < min_frame_bytes {
        return Decoded::Skipped {
            consumed: end,
            reason: SkipReason::Undersized(jpeg.len()),
        };
    }

    match decode_jpeg(jpeg) {
        Ok(raster) => Decoded::Frame {
            raster,
            consumed: end,
        },
        Err(e) => Decoded::Skipped {
            consumed: end,
            reason: SkipReason::Corrupt(e.to_string()),
        },
    }
}

/// Single-step form: the decoded raster, if any, and the unconsumed rest of
/// the buffer. The buffer comes back unchanged when no complete image is
/// present yet.
pub fn decode_next(buffer: &[u8], min_frame_bytes: usize) -> (Option<Raster>, &[u8]) {
    match decode(buffer, min_frame_bytes) {
        Decoded::Frame { raster, consumed } => (Some(raster), &buffer[consumed..]),
        Decoded::Skipped { consumed, .. } => (None, &buffer[consumed..]),
        Decoded::Incomplete => (None, buffer),
    }
}

/// Accumulates raw chunks and yields numbered frames in stream order.
pub struct FrameAssembler {
    buffer: BytesMut,
    min_frame_bytes: usize,
    max_buffer_bytes: usize,
    next_sequence: u64,
    skipped: u64,
}

impl FrameAssembler {
    pub fn new(min_frame_bytes: usize, max_buffer_bytes: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            min_frame_bytes,
            max_buffer_bytes,
            next_sequence: 0,
            skipped: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Decode the next complete frame, skipping corrupt ones. `None` means
    /// more input is needed.
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            match decode(&self.buffer, self.min_frame_bytes) {
                Decoded::Frame { raster, consumed } => {
                    self.buffer.advance(consumed);
                    let frame = Frame::new(raster, self.next_sequence);
                    self.next_sequence += 1;
                    return Some(frame);
                }
                Decoded::Skipped { consumed, reason } => {
                    self.buffer.advance(consumed);
                    self.skipped += 1;
                    metrics::counter!("astrocam_frames_skipped_total").increment(1);
                    warn!(?reason, "Dropping malformed frame");
                }
                Decoded::Incomplete => {
                    self.bound_lookahead();
                    return None;
                }
            }
        }
    }

    /// Drain every frame currently decodable.
    pub fn drain(&mut self) -> Vec<Frame> {
        std::iter::from_fn(|| self.next_frame()).collect()
    }

    /// Frames skipped as undersized or corrupt since creation
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Keep look-ahead bounded when the stream carries no usable frame.
    fn bound_lookahead(&mut self) {
        if self.buffer.len() <= self.max_buffer_bytes {
            return;
        }

        let before = self.buffer.len();
        let last_start = self
            .buffer
            .windows(2)
            .rposition(|w| w == SOI)
            .filter(|&pos| self.buffer.len() - pos <= self.max_buffer_bytes);

        match last_start {
            Some(pos) => self.buffer.advance(pos),
            None => {
                // Keep a trailing 0xFF in case it begins a marker.
                let keep = usize::from(self.buffer.last() == Some(&0xFF));
                let drop = self.buffer.len() - keep;
                self.buffer.advance(drop);
            }
        }
        debug!(before, after = self.buffer.len(), "Trimmed frame buffer");
    }
}
