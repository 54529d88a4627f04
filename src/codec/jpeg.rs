// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! JPEG marker segment handling.
//!
//! The encoder only ever touches the header of a JPEG: it walks the marker segments that precede
//! the frame header to find where new APPn segments can be inserted, and locates the EOI marker to
//! know where the primary image ends.

pub mod exif;
pub mod mpf;

use byteorder::BigEndian;
use byteorder::ByteOrder;
use thiserror::Error;

pub const MARKER_PREFIX: u8 = 0xff;
pub const SOI: u8 = 0xd8;
pub const EOI: u8 = 0xd9;
pub const SOS: u8 = 0xda;
pub const APP0: u8 = 0xe0;
pub const APP1: u8 = 0xe1;
pub const APP2: u8 = 0xe2;
pub const APP15: u8 = 0xef;
pub const COM: u8 = 0xfe;

/// Largest payload (length field included) a marker segment can carry.
pub const MAX_SEGMENT_LEN: usize = u16::MAX as usize;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JpegError {
    #[error("stream does not start with SOI")]
    MissingSoi,
    #[error("stream does not contain EOI")]
    MissingEoi,
    #[error("marker segment at offset {0} is truncated")]
    Truncated(usize),
    #[error("segment of {0} bytes does not fit a marker segment")]
    SegmentTooLarge(usize),
    #[error("not enough room in packet: {needed} bytes needed, {available} available")]
    NoRoom { needed: usize, available: usize },
}

pub type JpegResult<T> = Result<T, JpegError>;

/// A marker segment found in a JPEG header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment<'a> {
    /// Marker code, without the 0xff prefix.
    pub marker: u8,
    /// Offset of the 0xff prefix in the stream.
    pub offset: usize,
    /// Segment payload, after the length field.
    pub payload: &'a [u8],
}

impl Segment<'_> {
    /// Offset of the first byte following the segment.
    pub fn end(&self) -> usize {
        self.offset + 4 + self.payload.len()
    }
}

/// Iterator over the marker segments following SOI, up to (excluding) the first SOS.
pub struct Segments<'a> {
    data: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> Segments<'a> {
    pub fn new(data: &'a [u8]) -> JpegResult<Self> {
        if data.len() < 2 || data[0] != MARKER_PREFIX || data[1] != SOI {
            return Err(JpegError::MissingSoi);
        }

        Ok(Self {
            data,
            pos: 2,
            failed: false,
        })
    }
}

impl<'a> Iterator for Segments<'a> {
    type Item = JpegResult<Segment<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos + 4 > self.data.len() {
            return None;
        }

        let marker = self.data[self.pos + 1];
        if self.data[self.pos] != MARKER_PREFIX || marker == SOS || marker == EOI {
            return None;
        }

        let len = BigEndian::read_u16(&self.data[self.pos + 2..]) as usize;
        if len < 2 || self.pos + 2 + len > self.data.len() {
            self.failed = true;
            return Some(Err(JpegError::Truncated(self.pos)));
        }

        let segment = Segment {
            marker,
            offset: self.pos,
            payload: &self.data[self.pos + 4..self.pos + 2 + len],
        };
        self.pos = segment.end();

        Some(Ok(segment))
    }
}

fn is_app_or_com(marker: u8) -> bool {
    (APP0..=APP15).contains(&marker) || marker == COM
}

/// Returns the offset right after SOI and a leading APP0 (JFIF) segment, if any. This is where an
/// EXIF APP1 segment belongs.
pub fn exif_insert_position(data: &[u8]) -> JpegResult<usize> {
    let mut segments = Segments::new(data)?;
    match segments.next() {
        Some(Ok(segment)) if segment.marker == APP0 => Ok(segment.end()),
        Some(Err(e)) => Err(e),
        _ => Ok(2),
    }
}

/// Returns the offset right after all the APPn and COM segments that directly follow SOI. Any
/// userdata the codec embedded in the header lives in those segments.
pub fn app_segments_end(data: &[u8]) -> JpegResult<usize> {
    let mut end = 2;
    for segment in Segments::new(data)? {
        let segment = segment?;
        if !is_app_or_com(segment.marker) {
            break;
        }
        end = segment.end();
    }

    Ok(end)
}

/// Drops anything following the last EOI marker, e.g. padding left by the hardware.
pub fn truncate_after_eoi(data: &mut Vec<u8>) -> JpegResult<()> {
    let eoi = data
        .windows(2)
        .rposition(|w| w == [MARKER_PREFIX, EOI])
        .ok_or(JpegError::MissingEoi)?;

    let end = eoi + 2;
    if end != data.len() {
        log::debug!("Dropping {} bytes past EOI", data.len() - end);
        data.truncate(end);
    }

    Ok(())
}

/// Inserts `segment` (marker included) at `position`, provided the result fits in `capacity`.
pub fn insert_segment(
    data: &mut Vec<u8>,
    capacity: usize,
    position: usize,
    segment: &[u8],
) -> JpegResult<()> {
    let needed = data.len() + segment.len();
    if needed > capacity {
        return Err(JpegError::NoRoom {
            needed,
            available: capacity,
        });
    }

    data.splice(position..position, segment.iter().copied());
    Ok(())
}
