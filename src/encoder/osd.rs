// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! On-screen display regions.
//!
//! Up to [`MAX_OSD_REGIONS`] bitmaps can be overlaid on the encoded picture. Each region id owns
//! its own pool buffer, which is kept across frames and only replaced when a larger bitmap comes
//! in. Bitmaps are palette indices, one byte per pixel.

use thiserror::Error;

use crate::buffer_pool::BufferId;
use crate::buffer_pool::BufferPool;
use crate::buffer_pool::PoolError;
use crate::buffer_pool::PooledBuffer;
use crate::image_processing::BlitError;
use crate::image_processing::BlitFormat;
use crate::image_processing::ImageProcessor;
use crate::image_processing::ImageView;
use crate::image_processing::ImageViewMut;
use crate::image_processing::Rotation;
use crate::utils::align_up;
use crate::Rect;
use crate::Resolution;

pub const MAX_OSD_REGIONS: usize = 8;
/// Granularity of the region geometry, in pixels.
pub const OSD_ALIGNMENT: u32 = 16;

#[derive(Debug, Error)]
pub enum OsdError {
    #[error("OSD region id {0} out of range [0, 7]")]
    InvalidId(u32),
    #[error("OSD region {0} enabled without pixel data")]
    MissingData(u32),
    #[error("OSD region {id} needs {needed} bytes of pixel data, {got} given")]
    DataTooShort { id: u32, needed: usize, got: usize },
    #[error("OSD region {id} {rect:?} is empty or outside of the {picture} picture")]
    OutOfBounds {
        id: u32,
        rect: Rect,
        picture: Resolution,
    },
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Blit(#[from] BlitError),
}

/// Change of one OSD region.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OsdUpdate {
    pub id: u32,
    pub enable: bool,
    /// Inverts the luma of the picture under the region instead of drawing the bitmap.
    pub inverse: bool,
    pub rect: Rect,
    /// `rect.width * rect.height` palette indices. Required when enabling.
    pub data: Option<Vec<u8>>,
}

impl OsdUpdate {
    pub fn enable(id: u32, rect: Rect, data: Vec<u8>) -> Self {
        Self {
            id,
            enable: true,
            inverse: false,
            rect,
            data: Some(data),
        }
    }

    pub fn disable(id: u32) -> Self {
        Self {
            id,
            enable: false,
            inverse: false,
            rect: Default::default(),
            data: None,
        }
    }
}

struct OsdRegion {
    enabled: bool,
    inverse: bool,
    /// Aligned geometry, in encoded picture coordinates.
    rect: Rect,
    buffer: PooledBuffer,
}

/// A region as handed to the codec.
#[derive(Debug)]
pub struct RegionView<'a> {
    pub id: u32,
    pub rect: Rect,
    pub inverse: bool,
    pub buffer: BufferId,
    /// `rect.width` bytes per line, `rect.height` lines.
    pub data: &'a [u8],
}

/// All the enabled regions, consumed once per frame.
#[derive(Debug, Default)]
pub struct RegionSet<'a> {
    /// One more than the highest enabled id. Disabled ids below it still count.
    pub num_active: u32,
    pub regions: Vec<RegionView<'a>>,
}

fn align_rect(rect: Rect) -> Rect {
    Rect::new(
        align_up(rect.x, OSD_ALIGNMENT),
        align_up(rect.y, OSD_ALIGNMENT),
        align_up(rect.width, OSD_ALIGNMENT),
        align_up(rect.height, OSD_ALIGNMENT),
    )
}

/// Copies a `width` x `height` bitmap into `dst`, a `stride` bytes per line buffer of `lines`
/// lines, padding with zeroes.
fn copy_bitmap(
    dst: &mut [u8],
    stride: usize,
    lines: usize,
    src: &[u8],
    width: usize,
    height: usize,
) {
    dst[..stride * lines].fill(0);
    for (row, line) in src.chunks_exact(width).take(height).enumerate() {
        dst[row * stride..row * stride + width].copy_from_slice(line);
    }
}

/// Maps `rect` of a `picture` sized frame to its position once the frame is rotated clockwise.
fn rotate_rect(rect: Rect, picture: Resolution, rotation: Rotation) -> Rect {
    let Rect {
        x,
        y,
        width: w,
        height: h,
    } = rect;
    let Resolution {
        width: pw,
        height: ph,
    } = picture;

    match rotation {
        Rotation::R0 => rect,
        Rotation::R90 => Rect::new(ph - y - h, x, h, w),
        Rotation::R180 => Rect::new(pw - x - w, ph - y - h, w, h),
        Rotation::R270 => Rect::new(y, pw - x - w, h, w),
    }
}

pub struct OsdStore {
    regions: [Option<OsdRegion>; MAX_OSD_REGIONS],
    pool: BufferPool,
    /// Input picture size. Unknown (empty) until the session is configured.
    picture: Resolution,
    rotation: Rotation,
}

impl OsdStore {
    pub fn new(pool: BufferPool) -> Self {
        Self {
            regions: Default::default(),
            pool,
            picture: Default::default(),
            rotation: Default::default(),
        }
    }

    /// Sets the geometry of the pictures the regions are drawn on. Regions set afterwards are
    /// checked against it and rotated by `rotation`.
    pub fn set_geometry(&mut self, picture: Resolution, rotation: Rotation) {
        self.picture = picture;
        self.rotation = rotation;
    }

    /// Rotates the bitmap of `rect` to compensate for the rotation of the encoded picture.
    fn rotate_bitmap<P>(
        &self,
        processor: &mut P,
        id: u32,
        rect: Rect,
        data: &[u8],
    ) -> Result<(Rect, Vec<u8>), OsdError>
    where
        P: ImageProcessor + ?Sized,
    {
        if !rect.fits_in(self.picture) {
            return Err(OsdError::OutOfBounds {
                id,
                rect,
                picture: self.picture,
            });
        }

        let rotated = rotate_rect(rect, self.picture, self.rotation);
        let mut out = vec![0u8; data.len().min(rect.resolution().get_area())];

        let src = ImageView {
            format: BlitFormat::Index8,
            resolution: rect.resolution(),
            stride: rect.width as usize,
            ver_stride: rect.height as usize,
            data,
        };
        let mut dst = ImageViewMut {
            format: BlitFormat::Index8,
            resolution: rotated.resolution(),
            stride: rotated.width as usize,
            ver_stride: rotated.height as usize,
            data: &mut out,
        };
        processor.rotate(&src, &mut dst, self.rotation)?;

        log::debug!(
            "Rotated OSD region {id} by {} degrees: {rect:?} -> {rotated:?}",
            self.rotation.degrees()
        );

        Ok((rotated, out))
    }

    /// Applies `update`. On error the region is left exactly as it was.
    pub fn set_region<P>(&mut self, update: &OsdUpdate, processor: &mut P) -> Result<(), OsdError>
    where
        P: ImageProcessor + ?Sized,
    {
        let id = update.id;
        let index = id as usize;
        if index >= MAX_OSD_REGIONS {
            return Err(OsdError::InvalidId(id));
        }

        if !update.enable {
            if let Some(region) = self.regions[index].as_mut() {
                region.enabled = false;
            }
            log::debug!("Disabled OSD region {id}, num_active={}", self.num_active());
            return Ok(());
        }

        let data = update.data.as_deref().ok_or(OsdError::MissingData(id))?;
        let rect = update.rect;
        if rect.width == 0 || rect.height == 0 {
            return Err(OsdError::OutOfBounds {
                id,
                rect,
                picture: self.picture,
            });
        }
        let needed = rect.resolution().get_area();
        if data.len() < needed {
            return Err(OsdError::DataTooShort {
                id,
                needed,
                got: data.len(),
            });
        }

        let rotated;
        let (rect, data) = if self.rotation != Rotation::R0 {
            rotated = self.rotate_bitmap(processor, id, rect, &data[..needed])?;
            (rotated.0, rotated.1.as_slice())
        } else {
            (rect, data)
        };

        let aligned = align_rect(rect);
        if aligned != rect {
            log::warn!("OSD region {id} {rect:?} is not 16-aligned, using {aligned:?}");
        }

        let picture = self.rotation.apply(self.picture);
        if picture.get_area() != 0 {
            let coded = Resolution::from((
                align_up(picture.width, OSD_ALIGNMENT),
                align_up(picture.height, OSD_ALIGNMENT),
            ));
            if !aligned.fits_in(coded) {
                return Err(OsdError::OutOfBounds {
                    id,
                    rect: aligned,
                    picture,
                });
            }
        }

        let stride = aligned.width as usize;
        let lines = aligned.height as usize;
        let new_size = stride * lines;
        let (width, height) = (rect.width as usize, rect.height as usize);

        let reuse = self.regions[index]
            .as_ref()
            .is_some_and(|r| r.buffer.size() >= new_size);

        if reuse {
            if let Some(region) = self.regions[index].as_mut() {
                copy_bitmap(region.buffer.as_mut_slice(), stride, lines, data, width, height);
                region.rect = aligned;
                region.inverse = update.inverse;
                region.enabled = true;
                log::trace!(
                    "Reused buffer {:?} for OSD region {id} {aligned:?}",
                    region.buffer.id()
                );
            }
        } else {
            // Allocate first so that a failure leaves the current region untouched.
            let mut buffer = self.pool.alloc(new_size)?;
            copy_bitmap(buffer.as_mut_slice(), stride, lines, data, width, height);
            let new_id = buffer.id();

            let old = self.regions[index].replace(OsdRegion {
                enabled: true,
                inverse: update.inverse,
                rect: aligned,
                buffer,
            });
            match old {
                Some(old) => log::debug!(
                    "Grew OSD region {id} from {} to {new_size} bytes, buffer {:?} -> {new_id:?}",
                    old.buffer.size(),
                    old.buffer.id()
                ),
                None => log::debug!("Allocated buffer {new_id:?} for OSD region {id}"),
            }
        }

        log::debug!(
            "Enabled OSD region {id} {aligned:?}, num_active={}",
            self.num_active()
        );

        Ok(())
    }

    /// One more than the highest enabled region id, or 0 if no region is enabled.
    pub fn num_active(&self) -> u32 {
        self.regions
            .iter()
            .rposition(|r| r.as_ref().is_some_and(|r| r.enabled))
            .map_or(0, |i| i as u32 + 1)
    }

    /// The regions to attach to the next frame, if any is enabled.
    pub fn region_set(&self) -> Option<RegionSet<'_>> {
        let num_active = self.num_active();
        if num_active == 0 {
            return None;
        }

        let regions = self
            .regions
            .iter()
            .enumerate()
            .filter_map(|(id, r)| r.as_ref().filter(|r| r.enabled).map(|r| (id, r)))
            .map(|(id, r)| RegionView {
                id: id as u32,
                rect: r.rect,
                inverse: r.inverse,
                buffer: r.buffer.id(),
                data: &r.buffer.as_slice()[..r.rect.resolution().get_area()],
            })
            .collect();

        Some(RegionSet {
            num_active,
            regions,
        })
    }

    pub fn is_enabled(&self, id: u32) -> bool {
        self.regions
            .get(id as usize)
            .and_then(Option::as_ref)
            .is_some_and(|r| r.enabled)
    }

    /// Buffer currently backing region `id`, enabled or not.
    pub fn buffer_id(&self, id: u32) -> Option<BufferId> {
        self.regions
            .get(id as usize)
            .and_then(Option::as_ref)
            .map(|r| r.buffer.id())
    }

    /// Size of the buffer backing region `id`, or 0 if it never was enabled.
    pub fn capacity(&self, id: u32) -> usize {
        self.regions
            .get(id as usize)
            .and_then(Option::as_ref)
            .map_or(0, |r| r.buffer.size())
    }

    /// Releases every region buffer.
    pub fn clear(&mut self) {
        self.regions = Default::default();
    }
}
