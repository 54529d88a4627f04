// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Resolution of the bitrate envelope handed to the codec.
//!
//! Callers may give any of `min`, `target` and `max` (zero meaning unset). [`plan`] turns that into
//! a complete `min <= target <= max` triple, deriving the missing values with ratios depending on
//! the rate control law.

use std::fmt;

use thiserror::Error;

use crate::encoder::RcMode;

/// Lowest bitrate the hardware can be programmed with.
pub const MIN_BPS: u32 = 2_000;
/// Highest bitrate the hardware can be programmed with.
pub const MAX_BPS: u32 = 100_000_000;

/// A bitrate envelope, in bits per second.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RateSpec {
    pub min_bps: u32,
    pub target_bps: u32,
    pub max_bps: u32,
}

impl RateSpec {
    pub fn new(min_bps: u32, target_bps: u32, max_bps: u32) -> Self {
        Self {
            min_bps,
            target_bps,
            max_bps,
        }
    }

    /// Envelope with only the target set.
    pub fn target(target_bps: u32) -> Self {
        Self::new(0, target_bps, 0)
    }

    /// Envelope with only the maximum set.
    pub fn max(max_bps: u32) -> Self {
        Self::new(0, 0, max_bps)
    }

    fn is_ordered(&self) -> bool {
        self.min_bps <= self.target_bps && self.target_bps <= self.max_bps
    }
}

impl fmt::Display for RateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "min={} target={} max={}",
            self.min_bps, self.target_bps, self.max_bps
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RateControlError {
    #[error("{what} {value} out of range [2000, 100000000]")]
    OutOfRange { what: &'static str, value: u32 },
    #[error("bitrates {0} must satisfy 2000 <= min <= target <= max <= 100000000")]
    Inconsistent(RateSpec),
    #[error("cannot derive a {mode:?} envelope from {requested}")]
    Unsupported { mode: RcMode, requested: RateSpec },
}

fn check_range(what: &'static str, value: u32) -> Result<(), RateControlError> {
    if (MIN_BPS..=MAX_BPS).contains(&value) {
        Ok(())
    } else {
        Err(RateControlError::OutOfRange { what, value })
    }
}

/// Scales `value` by `num / den` without overflowing.
fn ratio(value: u32, num: u64, den: u64) -> u32 {
    (value as u64 * num / den).min(u32::MAX as u64) as u32
}

fn from_max(mode: RcMode, max: u32) -> RateSpec {
    let min = match mode {
        RcMode::Cbr => ratio(max, 8, 10),
        _ => ratio(max, 1, 4),
    };

    RateSpec::new(min, ratio(max, 9, 10), max)
}

fn from_target(mode: RcMode, target: u32) -> RateSpec {
    let min = match mode {
        RcMode::Cbr => ratio(target, 8, 9),
        _ => ratio(target, 10, 36),
    };

    RateSpec::new(min, target, ratio(target, 10, 9))
}

fn clamp(mut rate: RateSpec) -> RateSpec {
    rate.min_bps = rate.min_bps.max(MIN_BPS);
    rate.max_bps = rate.max_bps.min(MAX_BPS);
    if rate.target_bps < rate.min_bps {
        rate.target_bps = ((rate.min_bps as u64 + rate.max_bps as u64) / 2) as u32;
    }
    rate
}

/// Resolves `requested` into a complete envelope under `mode`.
///
/// A request with all three values set is used as is once checked. Otherwise the envelope is
/// derived from `max` alone or from `target` alone. Fixed QP ignores bitrates and always succeeds,
/// flattening the envelope onto the first value set among `max`, `target` and `min`.
pub fn plan(mode: RcMode, requested: RateSpec) -> Result<RateSpec, RateControlError> {
    let RateSpec {
        min_bps: min,
        target_bps: target,
        max_bps: max,
    } = requested;

    if mode == RcMode::FixQp {
        let Some(value) = [max, target, min].into_iter().find(|&v| v != 0) else {
            return Ok(RateSpec::default());
        };
        let value = value.clamp(MIN_BPS, MAX_BPS);
        return Ok(RateSpec::new(value, value, value));
    }

    if min != 0 && target != 0 && max != 0 {
        if min < MIN_BPS || max > MAX_BPS || !requested.is_ordered() {
            return Err(RateControlError::Inconsistent(requested));
        }
        return Ok(requested);
    }

    let derived = match (mode, min, target, max) {
        (_, 0, 0, max) if max != 0 => {
            check_range("max_bps", max)?;
            from_max(mode, max)
        }
        (_, 0, target, 0) if target != 0 => {
            check_range("target_bps", target)?;
            from_target(mode, target)
        }
        _ => return Err(RateControlError::Unsupported { mode, requested }),
    };

    let resolved = clamp(derived);
    log::debug!("Resolved {mode:?} bitrate {requested} -> {resolved}");

    Ok(resolved)
}
