// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Regions of interest.
//!
//! The list of regions is always replaced as a whole, so validation covers the complete list and
//! either accepts all of it or none.

use thiserror::Error;

use crate::encoder::MAX_QP;
use crate::utils::align_up;
use crate::utils::is_aligned;
use crate::Rect;
use crate::Resolution;
use crate::MAX_DIMENSION;

pub const MAX_ROI_REGIONS: usize = 8;
/// Alignment of ROI rectangles, i.e. the macroblock size.
pub const ROI_ALIGNMENT: u32 = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoiError {
    #[error("{0} ROI regions given, at most 8 supported")]
    TooMany(usize),
    #[error("ROI region {index} {rect:?} is not aligned to 16")]
    Unaligned { index: usize, rect: Rect },
    #[error("ROI region {index} {rect:?} has coordinates beyond 8192")]
    TooLarge { index: usize, rect: Rect },
    #[error("ROI region {index} {rect:?} is empty or outside of the {picture} picture")]
    OutsidePicture {
        index: usize,
        rect: Rect,
        picture: Resolution,
    },
    #[error("ROI region {index} QP {qp} out of range")]
    Qp { index: usize, qp: i32 },
    #[error("ROI region {index} uses area index {area}, at most 7 supported")]
    AreaIndex { index: usize, area: u32 },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RoiRegion {
    pub rect: Rect,
    /// Forces intra coding of the region.
    pub intra: bool,
    /// Whether `qp` is an absolute QP rather than a delta to the frame QP.
    pub abs_qp: bool,
    pub qp: i32,
    /// Hardware QP area the region is assigned to.
    pub area_index: u32,
}

impl RoiRegion {
    fn check(&self, index: usize, picture: Resolution) -> Result<(), RoiError> {
        let rect = self.rect;
        let coords = [rect.x, rect.y, rect.width, rect.height];

        if coords.iter().any(|&v| v >= MAX_DIMENSION) {
            return Err(RoiError::TooLarge { index, rect });
        }
        if coords.iter().any(|&v| !is_aligned(v, ROI_ALIGNMENT)) {
            return Err(RoiError::Unaligned { index, rect });
        }

        // The codec works on whole macroblocks, so the last partial one is addressable.
        let coded = Resolution::from((
            align_up(picture.width, ROI_ALIGNMENT),
            align_up(picture.height, ROI_ALIGNMENT),
        ));
        if rect.width == 0 || rect.height == 0 || !rect.fits_in(coded) {
            return Err(RoiError::OutsidePicture {
                index,
                rect,
                picture,
            });
        }

        let max_qp = MAX_QP as i32;
        let qp_range = if self.abs_qp {
            0..=max_qp
        } else {
            -max_qp..=max_qp
        };
        if !qp_range.contains(&self.qp) {
            return Err(RoiError::Qp { index, qp: self.qp });
        }

        if self.area_index as usize >= MAX_ROI_REGIONS {
            return Err(RoiError::AreaIndex {
                index,
                area: self.area_index,
            });
        }

        Ok(())
    }
}

/// Checks a complete list of regions for a `picture` sized frame.
pub fn validate(regions: &[RoiRegion], picture: Resolution) -> Result<(), RoiError> {
    if regions.len() > MAX_ROI_REGIONS {
        return Err(RoiError::TooMany(regions.len()));
    }

    regions
        .iter()
        .enumerate()
        .try_for_each(|(index, region)| region.check(index, picture))
}
