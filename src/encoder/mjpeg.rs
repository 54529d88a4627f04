// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::encoder::ConfigError;
use crate::encoder::RcMode;

pub const MIN_QUALITY: u32 = 1;
pub const MAX_QUALITY: u32 = 10;

/// Highest quantization factor of the JPEG encoder.
pub const MAX_QFACTOR: u32 = 99;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MjpegParams {
    /// Picture quality, from 1 (smallest) to 10 (best).
    pub quality: u32,
}

impl Default for MjpegParams {
    fn default() -> Self {
        Self { quality: 7 }
    }
}

impl MjpegParams {
    pub fn resolve(&self) -> Result<Self, ConfigError> {
        if !(MIN_QUALITY..=MAX_QUALITY).contains(&self.quality) {
            return Err(ConfigError::MjpegQuality(self.quality));
        }
        Ok(self.clone())
    }

    /// Quantization factor matching the quality.
    pub fn qfactor(&self) -> u32 {
        (self.quality * 10).min(MAX_QFACTOR)
    }

    /// Quantization factor bounds programmed under `mode`. Fixed QP pins the factor, the other
    /// laws let the rate control go as low as needed but never above the requested quality.
    pub fn qfactor_bounds(&self, mode: RcMode) -> (u32, u32) {
        match mode {
            RcMode::FixQp => (self.qfactor(), self.qfactor()),
            _ => (1, self.qfactor()),
        }
    }
}
