// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use enumn::N;

use crate::encoder::ConfigError;
use crate::encoder::QpConfig;
use crate::encoder::RcMode;

/// H.265 profiles supported by the hardware, valued as `general_profile_idc`.
#[repr(u32)]
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Profile {
    #[default]
    Main = 1,
}

/// H.265 levels, valued as `general_level_idc` (30 times the level number).
#[repr(u32)]
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    L1 = 30,
    L2 = 60,
    L2_1 = 63,
    L3 = 90,
    L3_1 = 93,
    #[default]
    L4 = 120,
    L4_1 = 123,
    L5 = 150,
    L5_1 = 153,
    L5_2 = 156,
    L6 = 180,
    L6_1 = 183,
    L6_2 = 186,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct H265Params {
    pub profile: Profile,
    pub level: Level,
    pub qp: QpConfig,
}

impl H265Params {
    pub fn resolve(&self, mode: RcMode) -> Result<Self, ConfigError> {
        Ok(Self {
            qp: self.qp.resolve(mode)?,
            ..self.clone()
        })
    }

    pub fn set_profile(&mut self, profile: u32, level: u32) -> Result<(), ConfigError> {
        let profile = Profile::n(profile)
            .ok_or_else(|| ConfigError::Profile(format!("unsupported H.265 profile {profile}")))?;
        let level = Level::n(level)
            .ok_or_else(|| ConfigError::Profile(format!("unsupported H.265 level {level}")))?;

        self.profile = profile;
        self.level = level;
        Ok(())
    }
}
