// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Encoder session and its configuration.
//!
//! [`EncoderConfig`] is what the user asks for. It is validated into a [`CodecConfig`], the fully
//! resolved configuration pushed to the codec in one shot.

pub mod change;
pub mod h264;
pub mod h265;
pub mod mjpeg;
pub mod osd;
pub mod rate_control;
pub mod roi;
pub mod session;
pub mod stats;
pub mod thumbnail;

use std::fmt;
use std::str::FromStr;

use enumn::N;
use thiserror::Error;

use crate::backend::BackendError;
use crate::buffer_pool::PoolError;
use crate::codec::jpeg::mpf::MpfError;
use crate::encoder::h264::H264Params;
use crate::encoder::h265::H265Params;
use crate::encoder::mjpeg::MjpegParams;
use crate::encoder::osd::OsdError;
use crate::encoder::rate_control::RateControlError;
use crate::encoder::rate_control::RateSpec;
use crate::encoder::roi::RoiError;
use crate::encoder::thumbnail::ThumbnailConfig;
use crate::encoder::thumbnail::ThumbnailError;
use crate::image_processing::BlitError;
pub use crate::image_processing::Rotation;
use crate::BlockingMode;
use crate::EncodedFormat;
use crate::PixelFormat;
use crate::Resolution;
use crate::MAX_DIMENSION;

/// Highest frame rate, in frames per second, accepted on input and output.
pub const MAX_FRAME_RATE: u32 = 60;
/// Longest group of pictures.
pub const MAX_GOP: u32 = 3000;
/// Highest QP of H.264 and H.265.
pub const MAX_QP: u32 = 51;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{what} {value} out of range [{min}, {max}]")]
    OutOfRange {
        what: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
    #[error("invalid frame rate {0}")]
    FrameRate(FrameRate),
    #[error(transparent)]
    RateControl(#[from] RateControlError),
    #[error("invalid rate control mode {0:?}")]
    InvalidRcMode(String),
    #[error("invalid QP configuration: {0}")]
    Qp(String),
    #[error("invalid profile or level: {0}")]
    Profile(String),
    #[error("MJPEG quality {0} out of range [1, 10]")]
    MjpegQuality(u32),
    #[error("invalid thumbnail configuration: {0}")]
    Thumbnail(String),
    #[error("userdata of {0} bytes exceeds the 1024 bytes limit")]
    Userdata(usize),
    #[error("rotation cannot change once encoding has started")]
    RotationLocked,
    #[error("{0} is not supported by the {1:?} codec")]
    Unsupported(&'static str, EncodedFormat),
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("encoder session is not initialized")]
    Uninitialized,
    #[error("encoder session is already initialized")]
    AlreadyInitialized,
    #[error("encoder session is closed")]
    Closed,
    #[error("frame does not match the configured geometry: {0}")]
    FrameMismatch(String),
    #[error("change request was dropped before being applied")]
    ChangeDropped,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Osd(#[from] OsdError),
    #[error(transparent)]
    Roi(#[from] RoiError),
    #[error(transparent)]
    Thumbnail(#[from] ThumbnailError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Blit(#[from] BlitError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Mpf(#[from] MpfError),
}

pub type EncodeResult<T> = Result<T, EncodeError>;

/// Rate control law. The discriminants are the values programmed into the hardware.
#[repr(u32)]
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum RcMode {
    Vbr = 0,
    #[default]
    Cbr = 1,
    FixQp = 2,
    Avbr = 3,
}

impl FromStr for RcMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cbr" => Ok(RcMode::Cbr),
            "vbr" => Ok(RcMode::Vbr),
            "avbr" => Ok(RcMode::Avbr),
            "fixqp" => Ok(RcMode::FixQp),
            other => other
                .parse::<u32>()
                .ok()
                .and_then(RcMode::n)
                .ok_or_else(|| ConfigError::InvalidRcMode(s.to_string())),
        }
    }
}

/// A frame rate expressed as a fraction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameRate {
    pub num: u32,
    pub den: u32,
}

impl FrameRate {
    pub fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    /// Frames per second, rounded up.
    pub fn ceil(&self) -> u32 {
        if self.den == 0 {
            return 0;
        }
        self.num.div_ceil(self.den)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let min = self.den as u64;
        let max = MAX_FRAME_RATE as u64 * self.den as u64;
        if self.den == 0 || !(min..=max).contains(&(self.num as u64)) {
            return Err(ConfigError::FrameRate(*self));
        }
        Ok(())
    }
}

impl Default for FrameRate {
    fn default() -> Self {
        Self::new(30, 1)
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// QP bounds of the H.264 and H.265 encoders.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QpConfig {
    /// Initial QP. Required, and the only value used, under [`RcMode::FixQp`].
    pub init: Option<u32>,
    pub min: u32,
    pub max: u32,
    /// Bounds applied to intra frames.
    pub min_i: u32,
    pub max_i: u32,
    /// Largest QP change between two frames.
    pub step: u32,
}

impl Default for QpConfig {
    fn default() -> Self {
        Self {
            init: None,
            min: 10,
            max: MAX_QP,
            min_i: 10,
            max_i: MAX_QP,
            step: 4,
        }
    }
}

impl QpConfig {
    /// Checks the bounds against `mode` and returns the values actually programmed.
    pub fn resolve(&self, mode: RcMode) -> Result<QpConfig, ConfigError> {
        if mode == RcMode::FixQp {
            let init = self
                .init
                .ok_or_else(|| ConfigError::Qp("fixed QP requires an initial QP".into()))?;
            if init > MAX_QP {
                return Err(ConfigError::Qp(format!("initial QP {init} above {MAX_QP}")));
            }
            return Ok(QpConfig {
                init: Some(init),
                min: init,
                max: init,
                min_i: init,
                max_i: init,
                step: 0,
            });
        }

        if self.min > self.max || self.max > MAX_QP {
            return Err(ConfigError::Qp(format!(
                "QP range [{}, {}] invalid",
                self.min, self.max
            )));
        }
        if self.min_i > self.max_i || self.max_i > MAX_QP {
            return Err(ConfigError::Qp(format!(
                "intra QP range [{}, {}] invalid",
                self.min_i, self.max_i
            )));
        }
        if self.step > MAX_QP {
            return Err(ConfigError::Qp(format!("QP step {} too large", self.step)));
        }
        if let Some(init) = self.init {
            if !(self.min..=self.max).contains(&init) {
                return Err(ConfigError::Qp(format!(
                    "initial QP {init} outside of [{}, {}]",
                    self.min, self.max
                )));
            }
        }

        Ok(*self)
    }
}

/// Codec specific parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CodecParams {
    H264(H264Params),
    H265(H265Params),
    Mjpeg(MjpegParams),
}

impl Default for CodecParams {
    fn default() -> Self {
        CodecParams::H264(Default::default())
    }
}

impl CodecParams {
    pub fn format(&self) -> EncodedFormat {
        match self {
            CodecParams::H264(_) => EncodedFormat::H264,
            CodecParams::H265(_) => EncodedFormat::H265,
            CodecParams::Mjpeg(_) => EncodedFormat::MJPEG,
        }
    }

    /// Validates the parameters under `mode` and returns their resolved version.
    pub fn resolve(&self, mode: RcMode) -> Result<CodecParams, ConfigError> {
        Ok(match self {
            CodecParams::H264(p) => CodecParams::H264(p.resolve(mode)?),
            CodecParams::H265(p) => CodecParams::H265(p.resolve(mode)?),
            CodecParams::Mjpeg(p) => CodecParams::Mjpeg(p.resolve()?),
        })
    }

    pub fn set_profile(&mut self, profile: u32, level: u32) -> Result<(), ConfigError> {
        match self {
            CodecParams::H264(p) => p.set_profile(profile, level),
            CodecParams::H265(p) => p.set_profile(profile, level),
            CodecParams::Mjpeg(_) => Err(ConfigError::Unsupported("profile", EncodedFormat::MJPEG)),
        }
    }

    pub fn set_qp(&mut self, qp: QpConfig) -> Result<(), ConfigError> {
        match self {
            CodecParams::H264(p) => p.qp = qp,
            CodecParams::H265(p) => p.qp = qp,
            CodecParams::Mjpeg(_) => {
                return Err(ConfigError::Unsupported("QP", EncodedFormat::MJPEG));
            }
        }
        Ok(())
    }

    pub fn set_mjpeg_quality(&mut self, quality: u32) -> Result<(), ConfigError> {
        match self {
            CodecParams::Mjpeg(p) => {
                p.quality = quality;
                Ok(())
            }
            other => Err(ConfigError::Unsupported("quality", other.format())),
        }
    }
}

fn check_range(what: &'static str, value: u32, min: u32, max: u32) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            what,
            value,
            min,
            max,
        })
    }
}

/// Configuration of an encoding session, as requested by the user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncoderConfig {
    pub input_format: PixelFormat,
    pub resolution: Resolution,
    /// Horizontal stride of the input frames, in pixels.
    pub hor_stride: u32,
    pub ver_stride: u32,
    pub input_fps: FrameRate,
    pub output_fps: FrameRate,
    pub gop: u32,
    pub rc_mode: RcMode,
    /// Requested bitrates. Unset values (zero) are derived by [`rate_control::plan`].
    pub bitrate: RateSpec,
    pub codec: CodecParams,
    pub rotation: Rotation,
    pub thumbnails: ThumbnailConfig,
    /// Whether packet retrieval waits for the codec.
    pub blocking: BlockingMode,
    /// Whether bitrate and frame rate statistics are gathered.
    pub stats: bool,
    /// Size of the packet buffers. Defaults to the size of an input frame.
    pub output_buffer_size: Option<usize>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            input_format: PixelFormat::NV12,
            resolution: Resolution::from((320, 240)),
            hor_stride: 320,
            ver_stride: 240,
            input_fps: Default::default(),
            output_fps: Default::default(),
            gop: 60,
            rc_mode: RcMode::Cbr,
            bitrate: RateSpec::target(2_000_000),
            codec: Default::default(),
            rotation: Default::default(),
            thumbnails: Default::default(),
            blocking: BlockingMode::Blocking,
            stats: false,
            output_buffer_size: None,
        }
    }
}

impl EncoderConfig {
    /// Checks every field and resolves the configuration to push to the codec.
    pub fn validate(&self) -> Result<CodecConfig, ConfigError> {
        let Resolution { width, height } = self.resolution;
        check_range("width", width, 1, MAX_DIMENSION)?;
        check_range("height", height, 1, MAX_DIMENSION)?;
        check_range("hor_stride", self.hor_stride, width, MAX_DIMENSION)?;
        check_range("ver_stride", self.ver_stride, height, MAX_DIMENSION)?;
        self.input_fps.validate()?;
        self.output_fps.validate()?;
        check_range("gop", self.gop, 1, MAX_GOP)?;

        let bitrate = rate_control::plan(self.rc_mode, self.bitrate)?;
        let codec = self.codec.resolve(self.rc_mode)?;
        self.thumbnails.validate(codec.format(), self.resolution)?;
        if !self.thumbnails.is_empty() && !self.input_format.is_yuv420() {
            return Err(ConfigError::Thumbnail(format!(
                "cannot make thumbnails out of {:?} frames",
                self.input_format
            )));
        }

        let output_buffer_size = self.output_buffer_size.unwrap_or_else(|| {
            self.input_format
                .frame_size(self.hor_stride, self.ver_stride)
        });
        if output_buffer_size == 0 {
            return Err(ConfigError::OutOfRange {
                what: "output_buffer_size",
                value: 0,
                min: 1,
                max: u32::MAX,
            });
        }

        Ok(CodecConfig {
            input_format: self.input_format,
            resolution: self.resolution,
            hor_stride: self.hor_stride,
            ver_stride: self.ver_stride,
            input_fps: self.input_fps,
            output_fps: self.output_fps,
            gop: self.gop,
            rc_mode: self.rc_mode,
            bitrate,
            codec,
            rotation: self.rotation,
            blocking: self.blocking,
            output_buffer_size,
        })
    }
}

/// Fully resolved configuration of the codec.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodecConfig {
    pub input_format: PixelFormat,
    pub resolution: Resolution,
    pub hor_stride: u32,
    pub ver_stride: u32,
    pub input_fps: FrameRate,
    pub output_fps: FrameRate,
    pub gop: u32,
    pub rc_mode: RcMode,
    pub bitrate: RateSpec,
    pub codec: CodecParams,
    pub rotation: Rotation,
    pub blocking: BlockingMode,
    /// Capacity of every packet buffer.
    pub output_buffer_size: usize,
}

impl CodecConfig {
    pub fn format(&self) -> EncodedFormat {
        self.codec.format()
    }

    /// Configuration of a single-shot encode of an I420 picture of `resolution`, used for
    /// thumbnails.
    pub fn for_thumbnail(&self, resolution: Resolution, hor_stride: u32, ver_stride: u32) -> Self {
        Self {
            input_format: PixelFormat::I420,
            resolution,
            hor_stride,
            ver_stride,
            gop: 1,
            rotation: Rotation::R0,
            output_buffer_size: PixelFormat::I420.frame_size(hor_stride, ver_stride),
            ..self.clone()
        }
    }
}
