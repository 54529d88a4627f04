// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Multi-Picture Format (CIPA DC-007) index and assembly.
//!
//! The primary JPEG gets an APP2 segment holding an MP index IFD right after its APPn segments.
//! Thumbnails are appended after the primary EOI and referenced from the MP entries, with offsets
//! relative to the TIFF header of the index (the "MP header").

use byteorder::BigEndian;
use byteorder::ByteOrder;
use bytes::BufMut;
use enumn::N;
use thiserror::Error;

use crate::codec::jpeg::app_segments_end;
use crate::codec::jpeg::insert_segment;
use crate::codec::jpeg::truncate_after_eoi;
use crate::codec::jpeg::JpegError;
use crate::codec::jpeg::Segments;
use crate::codec::jpeg::APP2;
use crate::codec::jpeg::MARKER_PREFIX;
use crate::codec::jpeg::MAX_SEGMENT_LEN;
use crate::Resolution;

pub const MPF_IDENTIFIER: &[u8; 4] = b"MPF\0";

pub const TAG_MPF_VERSION: u16 = 0xb000;
pub const TAG_NUMBER_OF_IMAGES: u16 = 0xb001;
pub const TAG_MP_ENTRY: u16 = 0xb002;
pub const TAG_IMAGE_UID_LIST: u16 = 0xb003;
pub const TAG_TOTAL_FRAMES: u16 = 0xb004;

const TYPE_LONG: u16 = 4;
const TYPE_UNDEFINED: u16 = 7;

const MPF_VERSION: &[u8; 4] = b"0100";

/// Marker, length and identifier preceding the MP header.
const SEGMENT_HEADER_LEN: usize = 2 + 2 + MPF_IDENTIFIER.len();
const TIFF_HEADER_LEN: usize = 8;
const INDEX_IFD_ENTRIES: usize = 5;
const INDEX_IFD_LEN: usize = 2 + INDEX_IFD_ENTRIES * 12 + 4;
/// Offset of the first MP entry from the MP header.
const MP_ENTRIES_OFFSET: usize = TIFF_HEADER_LEN + INDEX_IFD_LEN;
const MP_ENTRY_LEN: usize = 16;
const IMAGE_UID_LEN: usize = 33;

/// Flag of the MP entry of the representative image.
pub const ATTR_REPRESENTATIVE: u32 = 0x2000_0000;
const ATTR_TYPE_MASK: u32 = 0x00ff_ffff;

/// Largest picture still classified as a VGA sized thumbnail.
const VGA_THUMBNAIL_MAX: Resolution = Resolution {
    width: 640,
    height: 480,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MpfError {
    #[error(transparent)]
    Jpeg(#[from] JpegError),
    #[error("no MPF index segment found")]
    MissingIndex,
    #[error("malformed MPF index: {0}")]
    Malformed(&'static str),
}

pub type MpfResult<T> = Result<T, MpfError>;

/// Image type code of an MP entry.
#[repr(u32)]
#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
pub enum MpImageType {
    LargeThumbnailVga = 0x01_0001,
    LargeThumbnailFullHd = 0x01_0002,
    BaselinePrimary = 0x03_0000,
}

impl MpImageType {
    /// Thumbnail class matching a `resolution` sized picture.
    pub fn for_thumbnail(resolution: Resolution) -> Self {
        if VGA_THUMBNAIL_MAX.can_contain(resolution) {
            MpImageType::LargeThumbnailVga
        } else {
            MpImageType::LargeThumbnailFullHd
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MpEntry {
    pub attribute: u32,
    pub size: u32,
    /// Offset from the MP header. Always 0 for the primary image.
    pub offset: u32,
}

impl MpEntry {
    pub fn image_type(&self) -> Option<MpImageType> {
        MpImageType::n(self.attribute & ATTR_TYPE_MASK)
    }
}

/// The MP index written into the primary image.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MpIndex {
    pub entries: Vec<MpEntry>,
}

impl MpIndex {
    /// Size of the APP2 segment, marker included, for an index of `num_images` entries.
    pub fn segment_len(num_images: usize) -> usize {
        SEGMENT_HEADER_LEN + MP_ENTRIES_OFFSET + num_images * (MP_ENTRY_LEN + IMAGE_UID_LEN)
    }

    fn put_entry(out: &mut impl BufMut, tag: u16, kind: u16, count: u32, value: &[u8; 4]) {
        out.put_u16(tag);
        out.put_u16(kind);
        out.put_u32(count);
        out.put_slice(value);
    }

    /// Serializes the whole APP2 segment into `out`.
    pub fn write_into(&self, out: &mut impl BufMut) -> MpfResult<()> {
        let n = self.entries.len();
        let total = Self::segment_len(n);
        if total - 2 > MAX_SEGMENT_LEN {
            return Err(JpegError::SegmentTooLarge(total).into());
        }

        out.put_u8(MARKER_PREFIX);
        out.put_u8(APP2);
        out.put_u16((total - 2) as u16);
        out.put_slice(MPF_IDENTIFIER);

        out.put_slice(b"MM");
        out.put_u16(0x002a);
        out.put_u32(TIFF_HEADER_LEN as u32);

        let uid_offset = MP_ENTRIES_OFFSET + n * MP_ENTRY_LEN;

        out.put_u16(INDEX_IFD_ENTRIES as u16);
        Self::put_entry(out, TAG_MPF_VERSION, TYPE_UNDEFINED, 4, MPF_VERSION);
        Self::put_entry(
            out,
            TAG_NUMBER_OF_IMAGES,
            TYPE_LONG,
            1,
            &(n as u32).to_be_bytes(),
        );
        Self::put_entry(
            out,
            TAG_MP_ENTRY,
            TYPE_UNDEFINED,
            (n * MP_ENTRY_LEN) as u32,
            &(MP_ENTRIES_OFFSET as u32).to_be_bytes(),
        );
        Self::put_entry(
            out,
            TAG_IMAGE_UID_LIST,
            TYPE_UNDEFINED,
            (n * IMAGE_UID_LEN) as u32,
            &(uid_offset as u32).to_be_bytes(),
        );
        Self::put_entry(out, TAG_TOTAL_FRAMES, TYPE_LONG, 1, &1u32.to_be_bytes());
        // No further IFD.
        out.put_u32(0);

        for entry in &self.entries {
            out.put_u32(entry.attribute);
            out.put_u32(entry.size);
            out.put_u32(entry.offset);
            // Dependent image entry numbers.
            out.put_u16(0);
            out.put_u16(0);
        }

        for (index, entry) in self.entries.iter().enumerate() {
            let uid = format!("{:08x}{:08x}{:016x}", index, entry.size, entry.attribute);
            out.put_slice(uid.as_bytes());
            out.put_u8(0);
        }

        Ok(())
    }

    /// Reads back the MP index of a JPEG stream.
    pub fn parse(data: &[u8]) -> MpfResult<Self> {
        let segment = Segments::new(data)?
            .find(|s| match s {
                Ok(s) => s.marker == APP2 && s.payload.starts_with(MPF_IDENTIFIER),
                Err(_) => true,
            })
            .ok_or(MpfError::MissingIndex)??;

        let tiff = &segment.payload[MPF_IDENTIFIER.len()..];
        if tiff.len() < MP_ENTRIES_OFFSET || &tiff[..4] != b"MM\0*" {
            return Err(MpfError::Malformed("bad MP header"));
        }

        let ifd = tiff
            .get(BigEndian::read_u32(&tiff[4..]) as usize..)
            .filter(|ifd| ifd.len() >= 2)
            .ok_or(MpfError::Malformed("IFD out of bounds"))?;
        let count = BigEndian::read_u16(ifd) as usize;
        let mut num_images = None;
        let mut entries_offset = None;
        for i in 0..count {
            let entry = ifd
                .get(2 + i * 12..2 + (i + 1) * 12)
                .ok_or(MpfError::Malformed("IFD entry out of bounds"))?;
            match BigEndian::read_u16(entry) {
                TAG_NUMBER_OF_IMAGES => num_images = Some(BigEndian::read_u32(&entry[8..]) as usize),
                TAG_MP_ENTRY => entries_offset = Some(BigEndian::read_u32(&entry[8..]) as usize),
                _ => (),
            }
        }

        let (Some(n), Some(offset)) = (num_images, entries_offset) else {
            return Err(MpfError::Malformed("missing MP entry tags"));
        };
        let raw = tiff
            .get(offset..offset + n * MP_ENTRY_LEN)
            .ok_or(MpfError::Malformed("MP entries out of bounds"))?;

        Ok(Self {
            entries: raw
                .chunks_exact(MP_ENTRY_LEN)
                .map(|e| MpEntry {
                    attribute: BigEndian::read_u32(e),
                    size: BigEndian::read_u32(&e[4..]),
                    offset: BigEndian::read_u32(&e[8..]),
                })
                .collect(),
        })
    }
}

/// A thumbnail to append to the primary image.
#[derive(Clone, Copy, Debug)]
pub struct MpImage<'a> {
    pub data: &'a [u8],
    pub resolution: Resolution,
}

/// Outcome of [`assemble`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MpfReport {
    /// Number of images referenced by the index, primary included.
    pub images: usize,
    /// Length of the primary image, index included.
    pub primary_len: usize,
    /// Length of the whole packet.
    pub total_len: usize,
    /// Whether some thumbnail bytes did not fit in the packet.
    pub truncated: bool,
}

/// Turns the JPEG in `data` into an MPF file carrying `thumbnails`, without growing `data` beyond
/// `capacity` bytes.
///
/// Thumbnails that do not fit are truncated to the remaining room, and thumbnails left without any
/// room are dropped together with all the ones after them. Trailing thumbnails are also dropped
/// while the index referencing them does not fit. If not even a single entry index fits, `data` is
/// left as a plain JPEG and [`JpegError::NoRoom`] is returned.
pub fn assemble(
    data: &mut Vec<u8>,
    capacity: usize,
    thumbnails: &[MpImage],
) -> MpfResult<MpfReport> {
    truncate_after_eoi(data)?;
    let insert_at = app_segments_end(data)?;
    let original_len = data.len();

    let mut count = thumbnails.len();
    let (primary_len, sizes) = loop {
        if count == 0 {
            break (original_len, Vec::new());
        }

        let primary_len = original_len + MpIndex::segment_len(count + 1);
        if primary_len > capacity && count > 1 {
            log::warn!("No room for an index of {count} thumbnails, dropping the last one");
            count -= 1;
            continue;
        }
        if primary_len > capacity {
            return Err(JpegError::NoRoom {
                needed: primary_len,
                available: capacity,
            }
            .into());
        }

        let mut remaining = capacity - primary_len;
        let sizes = thumbnails[..count]
            .iter()
            .map(|t| {
                let len = t.data.len().min(remaining);
                remaining -= len;
                len
            })
            .collect::<Vec<_>>();

        let used = sizes.iter().take_while(|&&len| len > 0).count();
        if used == count {
            break (primary_len, sizes);
        }

        log::warn!(
            "No room left in packet for thumbnails {}..{}, dropping them",
            used + 1,
            count
        );
        count = used;
    };

    let mut truncated = count < thumbnails.len();
    if count == 0 {
        return Ok(MpfReport {
            images: 1,
            primary_len,
            total_len: primary_len,
            truncated,
        });
    }

    let mp_header = insert_at + SEGMENT_HEADER_LEN;
    let mut entries = vec![MpEntry {
        attribute: ATTR_REPRESENTATIVE | MpImageType::BaselinePrimary as u32,
        size: primary_len as u32,
        offset: 0,
    }];
    let mut position = primary_len;
    for (thumbnail, &size) in thumbnails.iter().zip(&sizes) {
        entries.push(MpEntry {
            attribute: MpImageType::for_thumbnail(thumbnail.resolution) as u32,
            size: size as u32,
            offset: (position - mp_header) as u32,
        });
        position += size;
    }

    let index = MpIndex { entries };
    let mut segment = Vec::with_capacity(MpIndex::segment_len(index.entries.len()));
    index.write_into(&mut segment)?;
    insert_segment(data, capacity, insert_at, &segment)?;

    for (i, (thumbnail, &size)) in thumbnails.iter().zip(&sizes).enumerate() {
        if size < thumbnail.data.len() {
            log::warn!(
                "Thumbnail {} truncated from {} to {} bytes to fit the packet",
                i + 1,
                thumbnail.data.len(),
                size
            );
            truncated = true;
        }
        data.extend_from_slice(&thumbnail.data[..size]);
    }

    log::debug!(
        "Assembled MPF images={} primary_len={primary_len} total_len={}",
        count + 1,
        data.len()
    );

    Ok(MpfReport {
        images: count + 1,
        primary_len,
        total_len: data.len(),
        truncated,
    })
}
