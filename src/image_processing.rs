// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! 2D blit operations used to prepare thumbnails and rotate OSD bitmaps.
//!
//! [`ImageProcessor`] is the seam towards a hardware 2D engine. [`SoftwareProcessor`] implements
//! it on the CPU with nearest-neighbour scaling, which is good enough for thumbnails.

use thiserror::Error;

use crate::buffer_pool::BufferPool;
use crate::buffer_pool::PoolError;
use crate::buffer_pool::PooledBuffer;
use crate::PixelFormat;
use crate::Rect;
use crate::Resolution;

#[derive(Debug, Error)]
pub enum BlitError {
    #[error("unsupported format conversion {src:?} -> {dst:?}")]
    Unsupported { src: BlitFormat, dst: BlitFormat },
    #[error("pixel format {0:?} cannot be blitted")]
    UnsupportedPixelFormat(PixelFormat),
    #[error("bad geometry: {0}")]
    BadGeometry(String),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Clockwise rotation applied to a picture.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Rotation {
    #[default]
    R0,
    R90,
    R180,
    R270,
}

impl Rotation {
    pub fn degrees(&self) -> u32 {
        match self {
            Rotation::R0 => 0,
            Rotation::R90 => 90,
            Rotation::R180 => 180,
            Rotation::R270 => 270,
        }
    }

    /// Whether the rotation swaps width and height.
    pub fn swaps_axes(&self) -> bool {
        matches!(self, Rotation::R90 | Rotation::R270)
    }

    /// Resolution of a `resolution` sized picture after rotation.
    pub fn apply(&self, resolution: Resolution) -> Resolution {
        if self.swaps_axes() {
            Resolution::from((resolution.height, resolution.width))
        } else {
            resolution
        }
    }
}

impl TryFrom<u32> for Rotation {
    type Error = u32;

    fn try_from(degrees: u32) -> Result<Self, Self::Error> {
        match degrees {
            0 => Ok(Rotation::R0),
            90 => Ok(Rotation::R90),
            180 => Ok(Rotation::R180),
            270 => Ok(Rotation::R270),
            _ => Err(degrees),
        }
    }
}

/// Layouts the blitter understands.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlitFormat {
    NV12,
    NV21,
    I420,
    /// One byte per pixel, e.g. palette indices of an OSD bitmap.
    Index8,
}

impl TryFrom<PixelFormat> for BlitFormat {
    type Error = BlitError;

    fn try_from(format: PixelFormat) -> Result<Self, Self::Error> {
        match format {
            PixelFormat::NV12 => Ok(BlitFormat::NV12),
            PixelFormat::NV21 => Ok(BlitFormat::NV21),
            PixelFormat::I420 => Ok(BlitFormat::I420),
            other => Err(BlitError::UnsupportedPixelFormat(other)),
        }
    }
}

impl BlitFormat {
    fn is_yuv420(&self) -> bool {
        !matches!(self, BlitFormat::Index8)
    }

    /// Offsets of each plane for a buffer of `stride` bytes per line and `ver_stride` lines.
    pub fn plane_offsets(&self, stride: usize, ver_stride: usize) -> [usize; 3] {
        let luma = stride * ver_stride;
        match self {
            BlitFormat::NV12 | BlitFormat::NV21 => [0, luma, luma],
            BlitFormat::I420 => [0, luma, luma + (stride / 2) * (ver_stride / 2)],
            BlitFormat::Index8 => [0, luma, luma],
        }
    }

    /// Minimum buffer size for the given strides.
    pub fn buffer_size(&self, stride: usize, ver_stride: usize) -> usize {
        let luma = stride * ver_stride;
        match self {
            BlitFormat::NV12 | BlitFormat::NV21 => luma + stride * (ver_stride / 2),
            BlitFormat::I420 => luma + 2 * (stride / 2) * (ver_stride / 2),
            BlitFormat::Index8 => luma,
        }
    }
}

/// Read-only view of a picture.
#[derive(Clone, Copy, Debug)]
pub struct ImageView<'a> {
    pub format: BlitFormat,
    pub resolution: Resolution,
    /// Bytes per luma line.
    pub stride: usize,
    /// Number of luma lines allocated.
    pub ver_stride: usize,
    pub data: &'a [u8],
}

/// Mutable view of a picture.
#[derive(Debug)]
pub struct ImageViewMut<'a> {
    pub format: BlitFormat,
    pub resolution: Resolution,
    pub stride: usize,
    pub ver_stride: usize,
    pub data: &'a mut [u8],
}

/// A picture backed by a pool buffer.
#[derive(Debug)]
pub struct OwnedImage {
    pub format: BlitFormat,
    pub resolution: Resolution,
    pub stride: usize,
    pub ver_stride: usize,
    pub buffer: PooledBuffer,
}

impl OwnedImage {
    /// Allocates a zeroed picture from `pool`.
    pub fn alloc(
        pool: &BufferPool,
        format: BlitFormat,
        resolution: Resolution,
        stride: usize,
        ver_stride: usize,
    ) -> Result<Self, BlitError> {
        let buffer = pool.alloc(format.buffer_size(stride, ver_stride))?;
        Ok(Self {
            format,
            resolution,
            stride,
            ver_stride,
            buffer,
        })
    }

    pub fn view(&self) -> ImageView<'_> {
        ImageView {
            format: self.format,
            resolution: self.resolution,
            stride: self.stride,
            ver_stride: self.ver_stride,
            data: self.buffer.as_slice(),
        }
    }

    pub fn view_mut(&mut self) -> ImageViewMut<'_> {
        ImageViewMut {
            format: self.format,
            resolution: self.resolution,
            stride: self.stride,
            ver_stride: self.ver_stride,
            data: self.buffer.as_mut_slice(),
        }
    }
}

fn check_layout(
    what: &str,
    format: BlitFormat,
    resolution: Resolution,
    stride: usize,
    ver_stride: usize,
    len: usize,
) -> Result<(), BlitError> {
    if resolution.width == 0 || resolution.height == 0 {
        return Err(BlitError::BadGeometry(format!("{what} has an empty resolution")));
    }
    if format.is_yuv420() && (resolution.width % 2 != 0 || resolution.height % 2 != 0) {
        return Err(BlitError::BadGeometry(format!(
            "{what} resolution {resolution} is not even"
        )));
    }
    if stride < resolution.width as usize || ver_stride < resolution.height as usize {
        return Err(BlitError::BadGeometry(format!(
            "{what} strides {stride}x{ver_stride} smaller than {resolution}"
        )));
    }
    if len < format.buffer_size(stride, ver_stride) {
        return Err(BlitError::BadGeometry(format!(
            "{what} buffer of {len} bytes too small for {stride}x{ver_stride}"
        )));
    }

    Ok(())
}

/// A 2D engine able to crop/scale and rotate pictures.
pub trait ImageProcessor {
    /// Checks whether a blit from `src` to `dst` layout is supported at all.
    fn check_format(&self, src: BlitFormat, dst: BlitFormat) -> Result<(), BlitError>;

    /// Crops `rect` out of `src` and scales it to fill `dst`.
    fn crop(&mut self, src: &ImageView, dst: &mut ImageViewMut, rect: Rect)
        -> Result<(), BlitError>;

    /// Rotates `src` clockwise by `rotation` into `dst`, whose resolution must be the rotated one.
    fn rotate(
        &mut self,
        src: &ImageView,
        dst: &mut ImageViewMut,
        rotation: Rotation,
    ) -> Result<(), BlitError>;
}

/// CPU implementation of [`ImageProcessor`].
#[derive(Debug, Default)]
pub struct SoftwareProcessor;

/// Location of one chroma component of `format` inside the buffer.
/// Returns `(plane offset, bytes between horizontally adjacent samples, component offset)`.
fn chroma_component(
    format: BlitFormat,
    offsets: [usize; 3],
    component: usize,
) -> (usize, usize, usize) {
    match (format, component) {
        (BlitFormat::NV12, c) => (offsets[1], 2, c),
        (BlitFormat::NV21, c) => (offsets[1], 2, 1 - c),
        (_, c) => (offsets[1 + c], 1, 0),
    }
}

fn chroma_stride(format: BlitFormat, stride: usize) -> usize {
    match format {
        BlitFormat::NV12 | BlitFormat::NV21 => stride,
        _ => stride / 2,
    }
}

/// Nearest-neighbour scale of one sample plane.
#[allow(clippy::too_many_arguments)]
fn scale_plane(
    src: &[u8],
    src_stride: usize,
    src_step: usize,
    src_rect: (usize, usize, usize, usize),
    dst: &mut [u8],
    dst_stride: usize,
    dst_step: usize,
    dst_size: (usize, usize),
) {
    let (sx, sy, sw, sh) = src_rect;
    let (dw, dh) = dst_size;

    for row in 0..dh {
        let src_row = sy + row * sh / dh;
        let src_line = &src[src_row * src_stride..];
        let dst_line = &mut dst[row * dst_stride..];
        for col in 0..dw {
            let src_col = sx + col * sw / dw;
            dst_line[col * dst_step] = src_line[src_col * src_step];
        }
    }
}

/// Rotation of one plane made of `elem` byte wide samples.
#[allow(clippy::too_many_arguments)]
fn rotate_plane(
    src: &[u8],
    src_stride: usize,
    (width, height): (usize, usize),
    dst: &mut [u8],
    dst_stride: usize,
    elem: usize,
    rotation: Rotation,
) {
    let (dst_width, dst_height) = if rotation.swaps_axes() {
        (height, width)
    } else {
        (width, height)
    };

    for dy in 0..dst_height {
        for dx in 0..dst_width {
            let (sx, sy) = match rotation {
                Rotation::R0 => (dx, dy),
                Rotation::R90 => (dy, height - 1 - dx),
                Rotation::R180 => (width - 1 - dx, height - 1 - dy),
                Rotation::R270 => (width - 1 - dy, dx),
            };
            let s = sy * src_stride + sx * elem;
            let d = dy * dst_stride + dx * elem;
            dst[d..d + elem].copy_from_slice(&src[s..s + elem]);
        }
    }
}

impl ImageProcessor for SoftwareProcessor {
    fn check_format(&self, src: BlitFormat, dst: BlitFormat) -> Result<(), BlitError> {
        match (src, dst) {
            (BlitFormat::Index8, BlitFormat::Index8) => Ok(()),
            (s, BlitFormat::I420) if s.is_yuv420() => Ok(()),
            (s, d) if s == d => Ok(()),
            (src, dst) => Err(BlitError::Unsupported { src, dst }),
        }
    }

    fn crop(
        &mut self,
        src: &ImageView,
        dst: &mut ImageViewMut,
        rect: Rect,
    ) -> Result<(), BlitError> {
        self.check_format(src.format, dst.format)?;
        check_layout(
            "source",
            src.format,
            src.resolution,
            src.stride,
            src.ver_stride,
            src.data.len(),
        )?;
        check_layout(
            "destination",
            dst.format,
            dst.resolution,
            dst.stride,
            dst.ver_stride,
            dst.data.len(),
        )?;
        if rect.width == 0 || rect.height == 0 || !rect.fits_in(src.resolution) {
            return Err(BlitError::BadGeometry(format!(
                "crop rectangle {rect:?} outside of {}",
                src.resolution
            )));
        }

        let (sx, sy) = (rect.x as usize, rect.y as usize);
        let (sw, sh) = (rect.width as usize, rect.height as usize);
        let (dw, dh) = (
            dst.resolution.width as usize,
            dst.resolution.height as usize,
        );

        log::trace!(
            "Crop {:?} {rect:?} of {} -> {:?} {}",
            src.format,
            src.resolution,
            dst.format,
            dst.resolution
        );

        scale_plane(
            src.data,
            src.stride,
            1,
            (sx, sy, sw, sh),
            dst.data,
            dst.stride,
            1,
            (dw, dh),
        );

        if !src.format.is_yuv420() {
            return Ok(());
        }

        let src_offsets = src.format.plane_offsets(src.stride, src.ver_stride);
        let dst_offsets = dst.format.plane_offsets(dst.stride, dst.ver_stride);
        let src_cstride = chroma_stride(src.format, src.stride);
        let dst_cstride = chroma_stride(dst.format, dst.stride);

        for component in 0..2 {
            let (src_off, src_step, src_comp) =
                chroma_component(src.format, src_offsets, component);
            let (dst_off, dst_step, dst_comp) =
                chroma_component(dst.format, dst_offsets, component);

            scale_plane(
                &src.data[src_off + src_comp..],
                src_cstride,
                src_step,
                (sx / 2, sy / 2, (sw / 2).max(1), (sh / 2).max(1)),
                &mut dst.data[dst_off + dst_comp..],
                dst_cstride,
                dst_step,
                (dw / 2, dh / 2),
            );
        }

        Ok(())
    }

    fn rotate(
        &mut self,
        src: &ImageView,
        dst: &mut ImageViewMut,
        rotation: Rotation,
    ) -> Result<(), BlitError> {
        if src.format != dst.format {
            return Err(BlitError::Unsupported {
                src: src.format,
                dst: dst.format,
            });
        }
        check_layout(
            "source",
            src.format,
            src.resolution,
            src.stride,
            src.ver_stride,
            src.data.len(),
        )?;
        check_layout(
            "destination",
            dst.format,
            dst.resolution,
            dst.stride,
            dst.ver_stride,
            dst.data.len(),
        )?;
        if rotation.apply(src.resolution) != dst.resolution {
            return Err(BlitError::BadGeometry(format!(
                "rotating {} by {} degrees cannot produce {}",
                src.resolution,
                rotation.degrees(),
                dst.resolution
            )));
        }

        let (w, h) = (
            src.resolution.width as usize,
            src.resolution.height as usize,
        );

        rotate_plane(src.data, src.stride, (w, h), dst.data, dst.stride, 1, rotation);

        if !src.format.is_yuv420() {
            return Ok(());
        }

        let src_offsets = src.format.plane_offsets(src.stride, src.ver_stride);
        let dst_offsets = dst.format.plane_offsets(dst.stride, dst.ver_stride);
        let src_cstride = chroma_stride(src.format, src.stride);
        let dst_cstride = chroma_stride(dst.format, dst.stride);

        match src.format {
            BlitFormat::NV12 | BlitFormat::NV21 => rotate_plane(
                &src.data[src_offsets[1]..],
                src_cstride,
                (w / 2, h / 2),
                &mut dst.data[dst_offsets[1]..],
                dst_cstride,
                2,
                rotation,
            ),
            _ => {
                for plane in 1..3 {
                    rotate_plane(
                        &src.data[src_offsets[plane]..],
                        src_cstride,
                        (w / 2, h / 2),
                        &mut dst.data[dst_offsets[plane]..],
                        dst_cstride,
                        1,
                        rotation,
                    );
                }
            }
        }

        Ok(())
    }
}
