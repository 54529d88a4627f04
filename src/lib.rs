// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Adapter layer around a block-mode hardware video encoder.
//!
//! The crate prepares frames for an opaque codec (see [`backend::EncoderBackend`]), resolves
//! rate-control envelopes, keeps on-screen-display regions alive across frames and packages JPEG
//! output with EXIF/MPF thumbnails.

pub mod backend;
pub mod buffer_pool;
pub mod codec;
pub mod encoder;
pub mod image_processing;
pub mod utils;

use std::fmt;
use std::str::FromStr;

use nix::sys::time::TimeVal;
use nix::sys::time::TimeValLike;

/// Largest width or height, in pixels, accepted by the encoder.
pub const MAX_DIMENSION: u32 = 8192;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Whether `self` can contain `other`.
    pub fn can_contain(&self, other: Self) -> bool {
        self.width >= other.width && self.height >= other.height
    }

    pub fn get_area(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A rectangle in pixel coordinates.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Rectangle covering the whole of `resolution`.
    pub fn full(resolution: Resolution) -> Self {
        Self::new(0, 0, resolution.width, resolution.height)
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::from((self.width, self.height))
    }

    /// Whether the rectangle lies entirely inside a `resolution` sized picture.
    pub fn fits_in(&self, resolution: Resolution) -> bool {
        self.x as u64 + self.width as u64 <= resolution.width as u64
            && self.y as u64 + self.height as u64 <= resolution.height as u64
    }
}

/// A FourCC code.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Fourcc(u32);

impl From<u32> for Fourcc {
    fn from(fourcc: u32) -> Self {
        Self(fourcc)
    }
}

impl From<Fourcc> for u32 {
    fn from(fourcc: Fourcc) -> Self {
        fourcc.0
    }
}

impl From<&[u8; 4]> for Fourcc {
    fn from(n: &[u8; 4]) -> Self {
        Self(n[0] as u32 | (n[1] as u32) << 8 | (n[2] as u32) << 16 | (n[3] as u32) << 24)
    }
}

impl From<Fourcc> for [u8; 4] {
    fn from(n: Fourcc) -> Self {
        [n.0 as u8, (n.0 >> 8) as u8, (n.0 >> 16) as u8, (n.0 >> 24) as u8]
    }
}

impl fmt::Display for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c: [u8; 4] = (*self).into();

        f.write_fmt(format_args!(
            "{}{}{}{}",
            c[0] as char, c[1] as char, c[2] as char, c[3] as char
        ))
    }
}

impl fmt::Debug for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("0x{:08x} ({})", self.0, self))
    }
}

/// Uncompressed pixel formats the encoder accepts as input.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    NV12,
    NV21,
    I420,
    YUYV,
    UYVY,
    RGB888,
    BGR888,
    ARGB8888,
}

impl PixelFormat {
    /// Bytes per pixel of the first plane, used to validate the horizontal stride.
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            PixelFormat::NV12 | PixelFormat::NV21 | PixelFormat::I420 => 1,
            PixelFormat::YUYV | PixelFormat::UYVY => 2,
            PixelFormat::RGB888 | PixelFormat::BGR888 => 3,
            PixelFormat::ARGB8888 => 4,
        }
    }

    /// Whether this is one of the 4:2:0 YUV layouts.
    pub fn is_yuv420(&self) -> bool {
        matches!(self, PixelFormat::NV12 | PixelFormat::NV21 | PixelFormat::I420)
    }

    /// Size of a frame with the given strides. `hor_stride` is in pixels.
    pub fn frame_size(&self, hor_stride: u32, ver_stride: u32) -> usize {
        let luma = hor_stride as usize * ver_stride as usize;
        match self {
            PixelFormat::NV12 | PixelFormat::NV21 | PixelFormat::I420 => luma * 3 / 2,
            _ => luma * self.bytes_per_pixel() as usize,
        }
    }

    pub fn fourcc(&self) -> Fourcc {
        Fourcc::from(match self {
            PixelFormat::NV12 => b"NV12",
            PixelFormat::NV21 => b"NV21",
            PixelFormat::I420 => b"YU12",
            PixelFormat::YUYV => b"YUYV",
            PixelFormat::UYVY => b"UYVY",
            PixelFormat::RGB888 => b"RGB3",
            PixelFormat::BGR888 => b"BGR3",
            PixelFormat::ARGB8888 => b"BA24",
        })
    }
}

impl FromStr for PixelFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nv12" | "NV12" => Ok(PixelFormat::NV12),
            "nv21" | "NV21" => Ok(PixelFormat::NV21),
            "i420" | "I420" | "yuv420p" => Ok(PixelFormat::I420),
            "yuyv" | "YUYV" => Ok(PixelFormat::YUYV),
            "uyvy" | "UYVY" => Ok(PixelFormat::UYVY),
            "rgb888" | "RGB888" => Ok(PixelFormat::RGB888),
            "bgr888" | "BGR888" => Ok(PixelFormat::BGR888),
            "argb8888" | "ARGB8888" => Ok(PixelFormat::ARGB8888),
            _ => Err("unrecognized input format. Valid values: nv12, nv21, i420, yuyv, uyvy, rgb888, bgr888, argb8888"),
        }
    }
}

/// Compressed output formats of the encoder.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EncodedFormat {
    H264,
    H265,
    MJPEG,
}

impl FromStr for EncodedFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "h264" | "H264" => Ok(EncodedFormat::H264),
            "h265" | "H265" | "hevc" | "HEVC" => Ok(EncodedFormat::H265),
            "mjpeg" | "MJPEG" | "jpeg" | "JPEG" => Ok(EncodedFormat::MJPEG),
            _ => Err("unrecognized output format. Valid values: h264, h265, mjpeg"),
        }
    }
}

/// Instructs the backend on whether it should block when retrieving packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockingMode {
    Blocking,
    NonBlocking,
}

impl Default for BlockingMode {
    fn default() -> Self {
        Self::Blocking
    }
}

/// Frame timestamp in microseconds.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub u64);

impl From<TimeVal> for Timestamp {
    fn from(value: TimeVal) -> Self {
        Timestamp(value.num_microseconds().max(0) as u64)
    }
}

impl From<&Timestamp> for TimeVal {
    fn from(value: &Timestamp) -> Self {
        let tv_sec = (value.0 / 1_000_000).min(i64::MAX as u64);
        let tv_usec = value.0 % 1_000_000;
        Self::new(tv_sec as i64, tv_usec as i64)
    }
}
