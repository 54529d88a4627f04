// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! EXIF APP1 segment carrying a JPEG thumbnail in IFD1.

use bytes::BufMut;

use crate::codec::jpeg::exif_insert_position;
use crate::codec::jpeg::insert_segment;
use crate::codec::jpeg::JpegError;
use crate::codec::jpeg::JpegResult;
use crate::codec::jpeg::APP1;
use crate::codec::jpeg::MARKER_PREFIX;
use crate::codec::jpeg::MAX_SEGMENT_LEN;

pub const EXIF_IDENTIFIER: &[u8; 6] = b"Exif\0\0";

const TAG_ORIENTATION: u16 = 0x0112;
const TAG_COMPRESSION: u16 = 0x0103;
const TAG_JPEG_INTERCHANGE_FORMAT: u16 = 0x0201;
const TAG_JPEG_INTERCHANGE_FORMAT_LENGTH: u16 = 0x0202;

const TYPE_SHORT: u16 = 3;
const TYPE_LONG: u16 = 4;

/// Compression value of a JPEG compressed thumbnail.
const COMPRESSION_JPEG: u16 = 6;

/// TIFF header size.
const TIFF_HEADER_LEN: usize = 8;
/// IFD0 holds a single orientation entry.
const IFD0_LEN: usize = 2 + 12 + 4;
/// IFD1 holds compression, thumbnail offset and thumbnail length.
const IFD1_LEN: usize = 2 + 3 * 12 + 4;
/// Offset of the thumbnail from the TIFF header.
const THUMBNAIL_OFFSET: usize = TIFF_HEADER_LEN + IFD0_LEN + IFD1_LEN;

/// Size of the complete APP1 segment (marker included) for a `thumbnail_len` bytes thumbnail.
pub fn segment_len(thumbnail_len: usize) -> usize {
    2 + 2 + EXIF_IDENTIFIER.len() + THUMBNAIL_OFFSET + thumbnail_len
}

fn put_entry(out: &mut impl BufMut, tag: u16, kind: u16, count: u32, value: u32) {
    out.put_u16(tag);
    out.put_u16(kind);
    out.put_u32(count);
    out.put_u32(value);
}

/// Builds the APP1 segment wrapping `thumbnail`.
pub fn build_segment(thumbnail: &[u8]) -> JpegResult<Vec<u8>> {
    let total = segment_len(thumbnail.len());
    if total - 2 > MAX_SEGMENT_LEN {
        return Err(JpegError::SegmentTooLarge(total));
    }

    let mut out = Vec::with_capacity(total);
    out.put_u8(MARKER_PREFIX);
    out.put_u8(APP1);
    out.put_u16((total - 2) as u16);
    out.put_slice(EXIF_IDENTIFIER);

    // Big endian TIFF header, IFD0 right after it.
    out.put_slice(b"MM");
    out.put_u16(0x002a);
    out.put_u32(TIFF_HEADER_LEN as u32);

    out.put_u16(1);
    // SHORT values are left aligned in the value field.
    put_entry(&mut out, TAG_ORIENTATION, TYPE_SHORT, 1, 1 << 16);
    out.put_u32((TIFF_HEADER_LEN + IFD0_LEN) as u32);

    out.put_u16(3);
    put_entry(
        &mut out,
        TAG_COMPRESSION,
        TYPE_SHORT,
        1,
        (COMPRESSION_JPEG as u32) << 16,
    );
    put_entry(
        &mut out,
        TAG_JPEG_INTERCHANGE_FORMAT,
        TYPE_LONG,
        1,
        THUMBNAIL_OFFSET as u32,
    );
    put_entry(
        &mut out,
        TAG_JPEG_INTERCHANGE_FORMAT_LENGTH,
        TYPE_LONG,
        1,
        thumbnail.len() as u32,
    );
    out.put_u32(0);

    out.put_slice(thumbnail);
    debug_assert_eq!(out.len(), total);

    Ok(out)
}

/// Inserts an EXIF APP1 segment holding `thumbnail` into the JPEG in `data`. Returns the number of
/// bytes added.
pub fn insert_thumbnail(data: &mut Vec<u8>, capacity: usize, thumbnail: &[u8]) -> JpegResult<usize> {
    let segment = build_segment(thumbnail)?;
    let position = exif_insert_position(data)?;
    insert_segment(data, capacity, position, &segment)?;

    log::debug!(
        "Inserted EXIF thumbnail at offset={position} thumbnail_bytes={} segment_bytes={}",
        thumbnail.len(),
        segment.len()
    );

    Ok(segment.len())
}
