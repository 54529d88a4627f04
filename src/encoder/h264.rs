// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use enumn::N;

use crate::encoder::ConfigError;
use crate::encoder::QpConfig;
use crate::encoder::RcMode;

/// H.264 profiles supported by the hardware, valued as `profile_idc`.
#[repr(u32)]
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Profile {
    Baseline = 66,
    #[default]
    Main = 77,
    High = 100,
}

/// H.264 levels, valued as `level_idc`.
#[repr(u32)]
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    L1 = 10,
    L1_1 = 11,
    L1_2 = 12,
    L1_3 = 13,
    L2_0 = 20,
    L2_1 = 21,
    L2_2 = 22,
    L3 = 30,
    L3_1 = 31,
    L3_2 = 32,
    #[default]
    L4 = 40,
    L4_1 = 41,
    L4_2 = 42,
    L5 = 50,
    L5_1 = 51,
    L5_2 = 52,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct H264Params {
    pub profile: Profile,
    pub level: Level,
    /// CABAC entropy coding. Not available in the baseline profile.
    pub cabac: bool,
    pub qp: QpConfig,
}

impl Default for H264Params {
    fn default() -> Self {
        // Artificial configuration with intent to be widely supported.
        Self {
            profile: Profile::Main,
            level: Level::L4,
            cabac: true,
            qp: Default::default(),
        }
    }
}

impl H264Params {
    pub fn resolve(&self, mode: RcMode) -> Result<Self, ConfigError> {
        if self.cabac && self.profile == Profile::Baseline {
            return Err(ConfigError::Profile(
                "CABAC is not available in the baseline profile".into(),
            ));
        }

        Ok(Self {
            qp: self.qp.resolve(mode)?,
            ..self.clone()
        })
    }

    /// Sets profile and level from their `profile_idc` and `level_idc` values. Switching to the
    /// baseline profile turns CABAC off.
    pub fn set_profile(&mut self, profile: u32, level: u32) -> Result<(), ConfigError> {
        let profile = Profile::n(profile)
            .ok_or_else(|| ConfigError::Profile(format!("unsupported H.264 profile {profile}")))?;
        let level = Level::n(level)
            .ok_or_else(|| ConfigError::Profile(format!("unsupported H.264 level {level}")))?;

        self.profile = profile;
        self.level = level;
        if profile == Profile::Baseline {
            self.cabac = false;
        }

        Ok(())
    }
}
