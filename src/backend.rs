// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interface towards the hardware codec.
//!
//! A backend is a provider of block-mode encoding, most likely a vendor media process platform. The
//! encoder session only talks to it through [`EncoderBackend`]: it opens a codec, pushes a complete
//! [`CodecConfig`] in one shot, submits one [`FrameDescriptor`] at a time and retrieves the
//! resulting [`PacketDescriptor`].

#[cfg(test)]
pub(crate) mod dummy;

use thiserror::Error;

use crate::encoder::osd::RegionSet;
use crate::encoder::roi::RoiRegion;
use crate::encoder::CodecConfig;
use crate::BlockingMode;
use crate::EncodedFormat;
use crate::PixelFormat;
use crate::Resolution;
use crate::Timestamp;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("codec is not opened")]
    NotOpened,
    #[error("codec {0:?} is not supported by this backend")]
    UnsupportedCodec(EncodedFormat),
    #[error("failed to configure codec: {0}")]
    Configure(String),
    #[error("failed to submit frame: {0}")]
    Submit(String),
    #[error("failed to retrieve packet: {0}")]
    Retrieve(String),
    #[error("timed out waiting for the codec")]
    Timeout,
    #[error("control command {0} rejected")]
    Control(&'static str),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// How the codec emits its own SEI messages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SeiMode {
    #[default]
    Disabled,
    OneSequence,
    OneFrame,
}

/// What the codec does with a frame exceeding the super frame thresholds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SuperFrameMode {
    #[default]
    None,
    Drop,
    Reencode,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SuperFrameConfig {
    pub mode: SuperFrameMode,
    /// Threshold for intra frames, in bits.
    pub i_max_bits: u32,
    /// Threshold for inter frames, in bits.
    pub p_max_bits: u32,
}

/// Out of band commands sent to an opened codec.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlCommand {
    SetSeiMode(SeiMode),
    RequestIdr,
    SetSuperFrame(SuperFrameConfig),
    /// ARGB palette the OSD bitmaps index into.
    SetOsdPalette(Box<[u32; 256]>),
}

impl ControlCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ControlCommand::SetSeiMode(_) => "SetSeiMode",
            ControlCommand::RequestIdr => "RequestIdr",
            ControlCommand::SetSuperFrame(_) => "SetSuperFrame",
            ControlCommand::SetOsdPalette(_) => "SetOsdPalette",
        }
    }
}

/// Metadata attached to a frame.
#[derive(Debug, Default)]
pub struct FrameSideData<'a> {
    pub roi: &'a [RoiRegion],
    pub osd: Option<RegionSet<'a>>,
    /// Userdata to embed as SEI (H.264/H.265) or APPn (MJPEG).
    pub userdata: Option<&'a [u8]>,
    /// Opaque debug bytes passed through to the codec.
    pub debug: Option<&'a [u8]>,
    /// Buffer the codec fills with motion vectors, if any.
    pub motion_vectors: Option<&'a mut [u8]>,
}

/// An uncompressed frame handed to the codec.
#[derive(Debug)]
pub struct FrameDescriptor<'a> {
    pub format: PixelFormat,
    pub resolution: Resolution,
    /// Horizontal stride, in pixels.
    pub hor_stride: u32,
    pub ver_stride: u32,
    pub timestamp: Timestamp,
    pub data: &'a [u8],
    /// Asks the codec to flush the packet of this frame right away.
    pub eos: bool,
    pub side: FrameSideData<'a>,
}

/// A compressed packet returned by the codec.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PacketDescriptor {
    /// Compressed bytes. The length of the vector is the valid length of the packet.
    pub data: Vec<u8>,
    pub keyframe: bool,
    pub temporal_id: u32,
    pub timestamp: Timestamp,
    pub eos: bool,
}

/// Generic trait for block-mode encoder backends.
pub trait EncoderBackend {
    /// Creates a codec instance producing `format`.
    ///
    /// `blocking` selects whether [`EncoderBackend::submit_frame`] waits for room in the codec
    /// input queue or fails with [`BackendError::Timeout`].
    fn open(&mut self, format: EncodedFormat, blocking: BlockingMode) -> BackendResult<()>;

    /// Applies a complete configuration. Called at init time and for every reconfiguration.
    fn configure(&mut self, config: &CodecConfig) -> BackendResult<()>;

    /// Submits one frame for encoding.
    fn submit_frame(&mut self, frame: FrameDescriptor<'_>) -> BackendResult<()>;

    /// Retrieves the next packet. `Ok(None)` means the codec consumed its input without producing
    /// any output, e.g. because it drops frames to honour the output frame rate.
    fn retrieve_packet(&mut self, blocking: BlockingMode) -> BackendResult<Option<PacketDescriptor>>;

    fn control(&mut self, command: ControlCommand) -> BackendResult<()>;

    /// Destroys the codec instance. The backend may be opened again afterwards.
    fn close(&mut self);
}

impl<B> EncoderBackend for Box<B>
where
    B: EncoderBackend + ?Sized,
{
    fn open(&mut self, format: EncodedFormat, blocking: BlockingMode) -> BackendResult<()> {
        (**self).open(format, blocking)
    }

    fn configure(&mut self, config: &CodecConfig) -> BackendResult<()> {
        (**self).configure(config)
    }

    fn submit_frame(&mut self, frame: FrameDescriptor<'_>) -> BackendResult<()> {
        (**self).submit_frame(frame)
    }

    fn retrieve_packet(&mut self, blocking: BlockingMode) -> BackendResult<Option<PacketDescriptor>> {
        (**self).retrieve_packet(blocking)
    }

    fn control(&mut self, command: ControlCommand) -> BackendResult<()> {
        (**self).control(command)
    }

    fn close(&mut self) {
        (**self).close()
    }
}
