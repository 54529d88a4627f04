// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The encoder session, owning one hardware codec instance.
//!
//! A session goes through `Uninitialized -> Configured -> Running -> Closed`. Frames are encoded
//! synchronously, one packet per [`EncoderSession::process`] call. Parameter changes are queued
//! through a [`ChangeSender`] and applied at the start of the next frame.

use crate::backend::ControlCommand;
use crate::backend::EncoderBackend;
use crate::backend::FrameDescriptor;
use crate::backend::FrameSideData;
use crate::backend::SeiMode;
use crate::buffer_pool::BufferPool;
use crate::encoder::change::ChangeQueue;
use crate::encoder::change::ChangeReceipt;
use crate::encoder::change::ChangeRequest;
use crate::encoder::change::ChangeSender;
use crate::encoder::osd::OsdStore;
use crate::encoder::osd::OsdUpdate;
use crate::encoder::roi;
use crate::encoder::roi::RoiRegion;
use crate::encoder::stats::EncoderStats;
use crate::encoder::stats::Statistics;
use crate::encoder::thumbnail::ThumbnailPackager;
use crate::encoder::CodecConfig;
use crate::encoder::ConfigError;
use crate::encoder::EncodeError;
use crate::encoder::EncodeResult;
use crate::encoder::EncoderConfig;
use crate::encoder::RcMode;
use crate::image_processing::BlitFormat;
use crate::image_processing::ImageProcessor;
use crate::image_processing::ImageView;
use crate::image_processing::SoftwareProcessor;
use crate::EncodedFormat;
use crate::PixelFormat;
use crate::Resolution;
use crate::Timestamp;

/// Largest userdata payload attached to a frame.
pub const MAX_USERDATA_LEN: usize = 1024;
/// Number of entries of the OSD palette.
pub const OSD_PALETTE_LEN: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Configured,
    Running,
    /// Queued changes are being applied.
    Reconfiguring,
    Closed,
}

/// An uncompressed frame to encode.
#[derive(Clone, Copy, Debug)]
pub struct InputFrame<'a> {
    pub format: PixelFormat,
    pub resolution: Resolution,
    /// Horizontal stride, in pixels.
    pub hor_stride: u32,
    pub ver_stride: u32,
    pub timestamp: Timestamp,
    pub data: &'a [u8],
}

/// Per-frame metadata provided by the caller.
#[derive(Debug, Default)]
pub struct SideData<'a> {
    /// Buffer for the codec to write the motion vectors of the frame into.
    pub motion_vectors: Option<&'a mut [u8]>,
    pub debug: Option<&'a [u8]>,
    /// Generate the configured thumbnails for this frame. Only meaningful for MJPEG.
    pub thumbnails: bool,
}

/// A compressed packet.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EncodedPacket {
    /// Payload, thumbnails included. Empty if the codec produced nothing for the frame.
    pub data: Vec<u8>,
    /// Size of the buffer the packet was produced into.
    pub capacity: usize,
    pub keyframe: bool,
    pub temporal_id: u32,
    pub timestamp: Timestamp,
    pub eos: bool,
}

impl EncodedPacket {
    pub fn valid_length(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug)]
struct Userdata {
    data: Vec<u8>,
    every_frame: bool,
}

/// The configuration in effect, as requested and as pushed to the codec.
#[derive(Debug)]
struct ActiveConfig {
    config: EncoderConfig,
    codec: CodecConfig,
}

pub struct EncoderSession<B, P = SoftwareProcessor>
where
    B: EncoderBackend,
    P: ImageProcessor,
{
    backend: B,
    processor: P,
    pool: BufferPool,
    state: SessionState,
    active: Option<ActiveConfig>,
    osd: OsdStore,
    roi: Vec<RoiRegion>,
    userdata: Option<Userdata>,
    thumbnails: Option<ThumbnailPackager>,
    changes: ChangeQueue,
    stats: Option<EncoderStats>,
    frames_encoded: u64,
}

impl<B, P> EncoderSession<B, P>
where
    B: EncoderBackend,
    P: ImageProcessor,
{
    pub fn new(backend: B, processor: P, pool: BufferPool) -> Self {
        Self {
            backend,
            processor,
            osd: OsdStore::new(pool.clone()),
            pool,
            state: SessionState::Uninitialized,
            active: None,
            roi: Vec::new(),
            userdata: None,
            thumbnails: None,
            changes: Default::default(),
            stats: None,
            frames_encoded: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The configuration in effect.
    pub fn config(&self) -> Option<&EncoderConfig> {
        self.active.as_ref().map(|a| &a.config)
    }

    /// The configuration pushed to the codec.
    pub fn codec_config(&self) -> Option<&CodecConfig> {
        self.active.as_ref().map(|a| &a.codec)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn roi(&self) -> &[RoiRegion] {
        &self.roi
    }

    pub fn osd(&self) -> &OsdStore {
        &self.osd
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded
    }

    /// Bitrate and frame rate measured over the last window, if statistics are enabled.
    pub fn statistics(&self) -> Option<Statistics> {
        self.stats.as_ref().and_then(EncoderStats::current)
    }

    /// A handle to queue changes from any thread.
    pub fn change_sender(&self) -> ChangeSender {
        self.changes.sender()
    }

    /// Queues `change` for the next frame.
    pub fn request(&self, change: ChangeRequest) -> ChangeReceipt {
        self.change_sender().request(change)
    }

    /// Opens and configures the codec.
    pub fn init(&mut self, config: EncoderConfig) -> EncodeResult<()> {
        match self.state {
            SessionState::Uninitialized => (),
            SessionState::Closed => return Err(EncodeError::Closed),
            _ => return Err(EncodeError::AlreadyInitialized),
        }

        let codec = config.validate()?;
        self.backend.open(codec.format(), codec.blocking)?;

        let configured = self.backend.configure(&codec).and_then(|()| {
            // Userdata is embedded by the session, not by the codec.
            self.backend
                .control(ControlCommand::SetSeiMode(SeiMode::Disabled))
        });
        if let Err(e) = configured {
            self.backend.close();
            return Err(e.into());
        }

        self.osd.set_geometry(config.resolution, config.rotation);
        self.thumbnails = (!config.thumbnails.is_empty()).then(|| {
            ThumbnailPackager::new(
                config.thumbnails.clone(),
                config.resolution,
                self.pool.clone(),
            )
        });
        self.stats = config
            .stats
            .then(|| EncoderStats::new(config.output_fps.ceil()));

        log::info!(
            "Encoder initialized: {:?} {} {:?} {} gop={} fps={}->{}",
            codec.format(),
            codec.resolution,
            codec.rc_mode,
            codec.bitrate,
            codec.gop,
            codec.input_fps,
            codec.output_fps
        );

        self.active = Some(ActiveConfig { config, codec });
        self.state = SessionState::Configured;

        Ok(())
    }

    fn check_open(&self) -> EncodeResult<()> {
        match self.state {
            SessionState::Uninitialized => Err(EncodeError::Uninitialized),
            SessionState::Closed => Err(EncodeError::Closed),
            _ => Ok(()),
        }
    }

    /// Validates `update` and pushes the full configuration to the codec, or leaves everything as
    /// it was.
    fn reconfigure<F>(&mut self, update: F) -> EncodeResult<()>
    where
        F: FnOnce(&mut EncoderConfig) -> Result<(), ConfigError>,
    {
        let active = self.active.as_ref().ok_or(EncodeError::Uninitialized)?;
        let mut config = active.config.clone();
        update(&mut config)?;
        let codec = config.validate()?;

        if let Err(e) = self.backend.configure(&codec) {
            if let Err(e) = self.backend.configure(&active.codec) {
                log::error!("Failed to restore the previous codec configuration: {e}");
            }
            return Err(e.into());
        }

        let resized = codec.resolution != active.codec.resolution;
        let rotated = codec.rotation != active.codec.rotation;
        let fps_changed = codec.output_fps != active.codec.output_fps;

        if resized || rotated {
            self.osd.set_geometry(config.resolution, config.rotation);
            if self.osd.num_active() > 0 {
                log::warn!("Dropping OSD regions after a geometry change");
                self.osd.clear();
            }
        }
        if resized {
            let picture = codec.resolution;
            let before = self.roi.len();
            self.roi
                .retain(|r| roi::validate(std::slice::from_ref(r), picture).is_ok());
            if self.roi.len() != before {
                log::warn!(
                    "Dropped {} ROI regions outside of {picture}",
                    before - self.roi.len()
                );
            }
        }
        if resized || self.thumbnails.is_some() {
            self.thumbnails = (!config.thumbnails.is_empty()).then(|| {
                ThumbnailPackager::new(
                    config.thumbnails.clone(),
                    config.resolution,
                    self.pool.clone(),
                )
            });
        }
        if fps_changed {
            if let Some(stats) = &mut self.stats {
                stats.set_window(codec.output_fps.ceil());
            }
        }

        log::debug!(
            "Reconfigured encoder: {} {:?} {} gop={}",
            codec.resolution,
            codec.rc_mode,
            codec.bitrate,
            codec.gop
        );

        self.active = Some(ActiveConfig { config, codec });
        Ok(())
    }

    fn set_roi(&mut self, regions: Vec<RoiRegion>) -> EncodeResult<()> {
        let picture = self
            .active
            .as_ref()
            .ok_or(EncodeError::Uninitialized)?
            .config
            .resolution;
        roi::validate(&regions, picture)?;
        self.roi = regions;
        Ok(())
    }

    fn set_userdata(&mut self, data: Vec<u8>, every_frame: bool) -> EncodeResult<()> {
        if data.len() > MAX_USERDATA_LEN {
            return Err(ConfigError::Userdata(data.len()).into());
        }
        self.userdata = (!data.is_empty()).then_some(Userdata { data, every_frame });
        Ok(())
    }

    fn apply_change(&mut self, change: ChangeRequest) -> EncodeResult<()> {
        match change {
            ChangeRequest::FrameRate { input, output } => self.reconfigure(|c| {
                c.input_fps = input;
                c.output_fps = output;
                Ok(())
            }),
            ChangeRequest::Bitrate(bitrate) => self.reconfigure(|c| {
                c.bitrate = bitrate;
                Ok(())
            }),
            ChangeRequest::RcMode(name) => {
                let mode = name.parse::<RcMode>()?;
                self.reconfigure(|c| {
                    c.rc_mode = mode;
                    Ok(())
                })
            }
            ChangeRequest::Profile { profile, level } => {
                self.reconfigure(|c| c.codec.set_profile(profile, level))
            }
            ChangeRequest::Gop(gop) => self.reconfigure(|c| {
                c.gop = gop;
                Ok(())
            }),
            ChangeRequest::Resolution {
                resolution,
                hor_stride,
                ver_stride,
            } => self.reconfigure(|c| {
                c.resolution = resolution;
                c.hor_stride = hor_stride;
                c.ver_stride = ver_stride;
                Ok(())
            }),
            ChangeRequest::Rotation(rotation) => {
                if self.frames_encoded > 0 {
                    return Err(ConfigError::RotationLocked.into());
                }
                self.reconfigure(|c| {
                    c.rotation = rotation;
                    Ok(())
                })
            }
            ChangeRequest::Roi(regions) => self.set_roi(regions),
            ChangeRequest::Osd(update) => self.set_osd_region(&update),
            ChangeRequest::Userdata { data, every_frame } => self.set_userdata(data, every_frame),
            ChangeRequest::ForceKeyframe => Ok(self.backend.control(ControlCommand::RequestIdr)?),
            ChangeRequest::SuperFrame(config) => {
                Ok(self.backend.control(ControlCommand::SetSuperFrame(config))?)
            }
            ChangeRequest::Qp(qp) => self.reconfigure(|c| c.codec.set_qp(qp)),
            ChangeRequest::MjpegQuality(quality) => {
                self.reconfigure(|c| c.codec.set_mjpeg_quality(quality))
            }
        }
    }

    /// Applies every queued change, reporting each outcome to its requester.
    fn apply_changes(&mut self) {
        let pending = self.changes.drain();
        if pending.is_empty() {
            return;
        }

        let previous = self.state;
        self.state = SessionState::Reconfiguring;

        for (change, reply) in pending {
            let name = change.name();
            let result = self.apply_change(change);
            match &result {
                Ok(()) => log::debug!("Applied {name} change"),
                Err(e) => log::warn!("Rejected {name} change: {e}"),
            }
            if reply.send(result).is_err() {
                log::warn!("Requester of the {name} change is gone, dropping its result");
            }
        }

        self.state = previous;
    }

    /// Sets or clears an OSD region. Takes effect on the next frame.
    pub fn set_osd_region(&mut self, update: &OsdUpdate) -> EncodeResult<()> {
        self.check_open()?;
        self.osd.set_region(update, &mut self.processor)?;
        Ok(())
    }

    /// Programs the ARGB palette the OSD bitmaps index into.
    pub fn set_osd_palette(&mut self, palette: &[u32]) -> EncodeResult<()> {
        self.check_open()?;
        if palette.len() != OSD_PALETTE_LEN {
            return Err(ConfigError::OutOfRange {
                what: "palette entries",
                value: palette.len() as u32,
                min: 256,
                max: 256,
            }
            .into());
        }

        let mut table = Box::new([0u32; OSD_PALETTE_LEN]);
        table.copy_from_slice(palette);
        self.backend.control(ControlCommand::SetOsdPalette(table))?;
        Ok(())
    }

    /// Encodes `frame` and returns its packet, which is empty if the codec produced nothing.
    ///
    /// Queued changes are applied first. A frame that does not match the configured geometry is
    /// rejected before reaching the codec.
    pub fn process(
        &mut self,
        frame: &InputFrame,
        side: SideData,
    ) -> EncodeResult<EncodedPacket> {
        self.check_open()?;
        self.apply_changes();

        let codec = self
            .active
            .as_ref()
            .ok_or(EncodeError::Uninitialized)?
            .codec
            .clone();

        if frame.format != codec.input_format
            || frame.resolution != codec.resolution
            || frame.hor_stride != codec.hor_stride
            || frame.ver_stride != codec.ver_stride
        {
            return Err(EncodeError::FrameMismatch(format!(
                "got {:?} {} strides {}x{}, configured for {:?} {} strides {}x{}",
                frame.format,
                frame.resolution,
                frame.hor_stride,
                frame.ver_stride,
                codec.input_format,
                codec.resolution,
                codec.hor_stride,
                codec.ver_stride
            )));
        }
        let needed = frame.format.frame_size(frame.hor_stride, frame.ver_stride);
        if frame.data.len() < needed {
            return Err(EncodeError::FrameMismatch(format!(
                "frame of {} bytes, {needed} expected",
                frame.data.len()
            )));
        }

        log::trace!(
            "Submitting frame timestamp={} bytes={}",
            frame.timestamp.0,
            frame.data.len()
        );

        self.backend.submit_frame(FrameDescriptor {
            format: frame.format,
            resolution: frame.resolution,
            hor_stride: frame.hor_stride,
            ver_stride: frame.ver_stride,
            timestamp: frame.timestamp,
            data: frame.data,
            eos: false,
            side: FrameSideData {
                roi: &self.roi,
                osd: self.osd.region_set(),
                userdata: self.userdata.as_ref().map(|u| u.data.as_slice()),
                debug: side.debug,
                motion_vectors: side.motion_vectors,
            },
        })?;

        if self.userdata.as_ref().is_some_and(|u| !u.every_frame) {
            self.userdata = None;
        }

        let mut packet = match self.backend.retrieve_packet(codec.blocking)? {
            Some(p) => EncodedPacket {
                data: p.data,
                capacity: codec.output_buffer_size,
                keyframe: p.keyframe,
                temporal_id: p.temporal_id,
                timestamp: p.timestamp,
                eos: p.eos,
            },
            None => {
                log::debug!(
                    "No packet for frame timestamp={}",
                    frame.timestamp.0
                );
                EncodedPacket {
                    capacity: codec.output_buffer_size,
                    timestamp: frame.timestamp,
                    ..Default::default()
                }
            }
        };

        if side.thumbnails && !packet.is_empty() && codec.format() == EncodedFormat::MJPEG {
            if let Some(thumbnails) = &self.thumbnails {
                match BlitFormat::try_from(frame.format) {
                    Ok(format) => {
                        let source = ImageView {
                            format,
                            resolution: frame.resolution,
                            stride: frame.hor_stride as usize,
                            ver_stride: frame.ver_stride as usize,
                            data: frame.data,
                        };
                        let report = thumbnails.package(
                            &mut self.backend,
                            &mut self.processor,
                            &codec,
                            &source,
                            &mut packet.data,
                            codec.output_buffer_size,
                        )?;
                        log::debug!(
                            "Packaged thumbnails app1={} app2={} truncated={} bytes={}",
                            report.app1,
                            report.app2,
                            report.truncated,
                            packet.valid_length()
                        );
                    }
                    Err(e) => log::warn!("Skipping thumbnails: {e}"),
                }
            }
        }

        if let Some(stats) = self.stats.as_mut().filter(|_| !packet.is_empty()) {
            stats.record(packet.valid_length());
        }
        self.frames_encoded += 1;
        self.state = SessionState::Running;

        Ok(packet)
    }

    /// Releases every resource and closes the codec. Pending changes are answered with
    /// [`EncodeError::Closed`].
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }

        for (change, reply) in self.changes.drain() {
            log::warn!("Dropping {} change, session is closing", change.name());
            let _ = reply.send(Err(EncodeError::Closed));
        }

        self.osd.clear();
        self.roi.clear();
        self.userdata = None;
        self.thumbnails = None;
        self.stats = None;
        if self.state != SessionState::Uninitialized {
            self.backend.close();
        }
        self.active = None;
        self.state = SessionState::Closed;

        log::info!("Encoder closed after {} frames", self.frames_encoded);
    }
}

impl<B, P> Drop for EncoderSession<B, P>
where
    B: EncoderBackend,
    P: ImageProcessor,
{
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::backend::BackendError;
    use crate::backend::dummy::Failure;
    use crate::codec::jpeg::mpf::MpIndex;
    use crate::codec::jpeg::Segments;
    use crate::codec::jpeg::APP1;
    use crate::encoder::mjpeg::MjpegParams;
    use crate::encoder::rate_control::RateSpec;
    use crate::encoder::roi::RoiError;
    use crate::encoder::thumbnail::ThumbnailSlot;
    use crate::encoder::CodecParams;
    use crate::encoder::FrameRate;
    use crate::encoder::Rotation;
    use crate::image_processing::tests::FailingProcessor;
    use crate::Rect;

    fn config(width: u32, height: u32) -> EncoderConfig {
        EncoderConfig {
            resolution: Resolution::from((width, height)),
            hor_stride: width,
            ver_stride: height,
            ..Default::default()
        }
    }

    fn mjpeg_config() -> EncoderConfig {
        let mut config = config(640, 480);
        config.codec = CodecParams::Mjpeg(MjpegParams::default());
        config.thumbnails.slots = vec![
            ThumbnailSlot::app1(),
            ThumbnailSlot::app2(Resolution::from((320, 240))),
        ];
        config
    }

    fn session<P: ImageProcessor>(processor: P) -> EncoderSession<DummyBackend, P> {
        let _ = env_logger::builder().is_test(true).try_init();
        EncoderSession::new(DummyBackend::default(), processor, BufferPool::default())
    }

    fn nv12(resolution: Resolution) -> Vec<u8> {
        let len = PixelFormat::NV12.frame_size(resolution.width, resolution.height);
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn frame(data: &[u8], resolution: Resolution, timestamp: u64) -> InputFrame<'_> {
        InputFrame {
            format: PixelFormat::NV12,
            resolution,
            hor_stride: resolution.width,
            ver_stride: resolution.height,
            timestamp: Timestamp(timestamp),
            data,
        }
    }

    fn roi(x: u32, y: u32) -> RoiRegion {
        RoiRegion {
            rect: Rect::new(x, y, 64, 64),
            qp: -3,
            ..Default::default()
        }
    }

    #[test]
    fn test_cbr_1080p() {
        let mut session = session(SoftwareProcessor);
        let res = Resolution::from((1920, 1080));
        session.init(config(1920, 1080)).unwrap();
        assert_eq!(session.state(), SessionState::Configured);

        let codec = session.codec_config().unwrap();
        assert_eq!(codec.rc_mode, RcMode::Cbr);
        assert_eq!(codec.bitrate, RateSpec::new(1_777_777, 2_000_000, 2_222_222));
        assert_eq!(
            session.backend().controls,
            vec![ControlCommand::SetSeiMode(SeiMode::Disabled)]
        );

        let data = nv12(res);
        let first = session
            .process(&frame(&data, res, 0), Default::default())
            .unwrap();
        assert!(first.valid_length() > 0);
        assert!(first.keyframe);
        assert_eq!(first.timestamp, Timestamp(0));
        assert_eq!(first.capacity, data.len());

        let second = session
            .process(&frame(&data, res, 33_333), Default::default())
            .unwrap();
        assert!(!second.keyframe);
        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(session.frames_encoded(), 2);
    }

    #[test]
    fn test_rejected_roi_keeps_previous_regions() {
        let mut session = session(SoftwareProcessor);
        let res = Resolution::from((1920, 1080));
        session.init(config(1920, 1080)).unwrap();
        let data = nv12(res);

        let accepted = session.request(ChangeRequest::Roi(vec![roi(64, 64)]));
        session
            .process(&frame(&data, res, 0), Default::default())
            .unwrap();
        assert!(accepted.wait().is_ok());

        let rejected = session.request(ChangeRequest::Roi(vec![roi(8200, 0)]));
        session
            .process(&frame(&data, res, 1), Default::default())
            .unwrap();
        assert!(matches!(
            rejected.wait(),
            Err(EncodeError::Roi(RoiError::TooLarge { index: 0, .. }))
        ));

        let frames = &session.backend().frames;
        assert_eq!(frames[0].roi, vec![roi(64, 64)]);
        assert_eq!(frames[1].roi, vec![roi(64, 64)]);
        assert_eq!(session.roi(), &[roi(64, 64)]);
    }

    #[test]
    fn test_rejected_roi_without_previous_regions() {
        let mut session = session(SoftwareProcessor);
        let res = Resolution::from((1920, 1080));
        session.init(config(1920, 1080)).unwrap();
        let data = nv12(res);

        let rejected = session.request(ChangeRequest::Roi(vec![roi(8200, 0)]));
        session
            .process(&frame(&data, res, 0), Default::default())
            .unwrap();
        assert!(rejected.wait().is_err());
        assert!(session.backend().frames[0].roi.is_empty());
    }

    #[test]
    fn test_thumbnails_are_packaged() {
        let mut session = session(SoftwareProcessor);
        session.init(mjpeg_config()).unwrap();
        let primary = session.codec_config().unwrap().clone();
        let res = primary.resolution;
        let data = nv12(res);

        let packet = session
            .process(
                &frame(&data, res, 0),
                SideData {
                    thumbnails: true,
                    ..Default::default()
                },
            )
            .unwrap();

        assert!(Segments::new(&packet.data)
            .unwrap()
            .any(|s| s.is_ok_and(|s| s.marker == APP1)));
        assert_eq!(MpIndex::parse(&packet.data).unwrap().entries.len(), 2);
        assert!(packet.valid_length() <= packet.capacity);
        assert_eq!(session.backend().configs.last(), Some(&primary));

        // The codec is back at full resolution.
        session
            .process(&frame(&data, res, 1), Default::default())
            .unwrap();
        let last = session.backend().frames.last().unwrap();
        assert_eq!(last.resolution, res);
        assert!(!last.eos);
    }

    #[test]
    fn test_thumbnail_blit_failure_restores_primary_config() {
        let mut session = session(FailingProcessor);
        session.init(mjpeg_config()).unwrap();
        let primary = session.codec_config().unwrap().clone();
        let res = primary.resolution;
        let data = nv12(res);

        let packet = session
            .process(
                &frame(&data, res, 0),
                SideData {
                    thumbnails: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(packet.valid_length() > 0);
        assert!(MpIndex::parse(&packet.data).is_err());
        assert_eq!(session.backend().configs.last(), Some(&primary));

        session
            .process(&frame(&data, res, 1), Default::default())
            .unwrap();
        assert_eq!(session.backend().frames.last().unwrap().resolution, res);
    }

    #[test]
    fn test_mismatching_frame_is_rejected() {
        let mut session = session(SoftwareProcessor);
        session.init(config(1920, 1080)).unwrap();

        let res = Resolution::from((640, 480));
        let data = nv12(res);
        assert!(matches!(
            session.process(&frame(&data, res, 0), Default::default()),
            Err(EncodeError::FrameMismatch(_))
        ));

        let res = Resolution::from((1920, 1080));
        assert!(matches!(
            session.process(&frame(&data, res, 0), Default::default()),
            Err(EncodeError::FrameMismatch(_))
        ));
        assert!(session.backend().frames.is_empty());
    }

    #[test]
    fn test_lifecycle() {
        let mut session = session(SoftwareProcessor);
        let res = Resolution::from((320, 240));
        let data = nv12(res);
        assert!(matches!(
            session.process(&frame(&data, res, 0), Default::default()),
            Err(EncodeError::Uninitialized)
        ));

        let mut invalid = config(320, 240);
        invalid.gop = 0;
        assert!(matches!(session.init(invalid), Err(EncodeError::Config(_))));
        assert_eq!(session.state(), SessionState::Uninitialized);
        assert!(session.backend().opened.is_none());

        session.init(config(320, 240)).unwrap();
        assert!(matches!(
            session.init(config(320, 240)),
            Err(EncodeError::AlreadyInitialized)
        ));

        let pending = session.request(ChangeRequest::Gop(10));
        session.close();
        assert!(matches!(pending.wait(), Err(EncodeError::Closed)));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.backend().close_count, 1);
        assert!(matches!(
            session.process(&frame(&data, res, 0), Default::default()),
            Err(EncodeError::Closed)
        ));

        session.close();
        assert_eq!(session.backend().close_count, 1);
    }

    #[test]
    fn test_failed_configure_at_init_closes_codec() {
        let mut session = session(SoftwareProcessor);
        session.backend_mut().fail_next(Failure::Configure);
        assert!(matches!(
            session.init(config(320, 240)),
            Err(EncodeError::Backend(_))
        ));
        assert_eq!(session.backend().close_count, 1);
        assert_eq!(session.state(), SessionState::Uninitialized);
    }

    #[test]
    fn test_rc_mode_change() {
        let mut session = session(SoftwareProcessor);
        let res = Resolution::from((320, 240));
        session.init(config(320, 240)).unwrap();
        let data = nv12(res);

        let invalid = session.request(ChangeRequest::RcMode("turbo".into()));
        session
            .process(&frame(&data, res, 0), Default::default())
            .unwrap();
        assert!(matches!(
            invalid.wait(),
            Err(EncodeError::Config(ConfigError::InvalidRcMode(_)))
        ));
        assert_eq!(session.config().unwrap().rc_mode, RcMode::Cbr);
        assert_eq!(session.backend().configs.len(), 1);

        let vbr = session.request(ChangeRequest::RcMode("VBR".into()));
        session
            .process(&frame(&data, res, 1), Default::default())
            .unwrap();
        assert!(vbr.wait().is_ok());
        let codec = session.codec_config().unwrap();
        assert_eq!(codec.rc_mode, RcMode::Vbr);
        assert_eq!(codec.bitrate.target_bps, 2_000_000);
        assert_eq!(session.backend().configs.last(), Some(codec));
    }

    #[test]
    fn test_failed_reconfigure_keeps_configuration() {
        let mut session = session(SoftwareProcessor);
        let res = Resolution::from((320, 240));
        session.init(config(320, 240)).unwrap();
        let original = session.codec_config().unwrap().clone();
        let data = nv12(res);

        session.backend_mut().fail_next(Failure::Configure);
        let gop = session.request(ChangeRequest::Gop(30));
        session
            .process(&frame(&data, res, 0), Default::default())
            .unwrap();

        assert!(matches!(gop.wait(), Err(EncodeError::Backend(_))));
        assert_eq!(session.config().unwrap().gop, 60);
        assert_eq!(session.backend().configs.last(), Some(&original));
    }

    #[test]
    fn test_no_packet_gives_empty_output() {
        let mut session = session(SoftwareProcessor);
        let res = Resolution::from((320, 240));
        session.init(config(320, 240)).unwrap();
        let data = nv12(res);

        session.backend_mut().skip_packets = 1;
        let packet = session
            .process(&frame(&data, res, 7), Default::default())
            .unwrap();
        assert_eq!(packet.valid_length(), 0);
        assert_eq!(packet.timestamp, Timestamp(7));

        let packet = session
            .process(&frame(&data, res, 8), Default::default())
            .unwrap();
        assert!(packet.valid_length() > 0);
    }

    #[test]
    fn test_statistics_count_emitted_packets() {
        let mut session = session(SoftwareProcessor);
        let res = Resolution::from((320, 240));
        let mut config = config(320, 240);
        config.output_fps = FrameRate::new(2, 1);
        config.stats = true;
        session.init(config).unwrap();
        let data = nv12(res);

        session.backend_mut().skip_packets = 2;
        for ts in 0..2 {
            let packet = session
                .process(&frame(&data, res, ts), Default::default())
                .unwrap();
            assert!(packet.is_empty());
        }
        assert_eq!(session.statistics(), None);

        for ts in 2..4 {
            session
                .process(&frame(&data, res, ts), Default::default())
                .unwrap();
        }
        let stats = session.statistics().unwrap();
        assert_eq!(stats.frames, 2);
        assert!(stats.bits_per_second > 0);
    }

    #[test]
    fn test_submit_failure_fails_only_current_frame() {
        let mut session = session(SoftwareProcessor);
        let res = Resolution::from((320, 240));
        session.init(config(320, 240)).unwrap();
        let data = nv12(res);

        session.backend_mut().fail_next(Failure::Submit);
        assert!(matches!(
            session.process(&frame(&data, res, 0), Default::default()),
            Err(EncodeError::Backend(BackendError::Submit(_)))
        ));
        assert!(session.backend().frames.is_empty());
        assert_eq!(session.frames_encoded(), 0);

        let packet = session
            .process(&frame(&data, res, 1), Default::default())
            .unwrap();
        assert!(packet.valid_length() > 0);
        assert_eq!(packet.timestamp, Timestamp(1));
        assert_eq!(session.backend().frames.len(), 1);
        assert_eq!(session.frames_encoded(), 1);
    }

    #[test]
    fn test_retrieve_failure_fails_only_current_frame() {
        let mut session = session(SoftwareProcessor);
        let res = Resolution::from((320, 240));
        session.init(config(320, 240)).unwrap();
        let data = nv12(res);

        session.backend_mut().fail_next(Failure::Retrieve);
        assert!(matches!(
            session.process(&frame(&data, res, 0), Default::default()),
            Err(EncodeError::Backend(BackendError::Retrieve(_)))
        ));
        assert_eq!(session.frames_encoded(), 0);

        let packet = session
            .process(&frame(&data, res, 1), Default::default())
            .unwrap();
        assert!(packet.valid_length() > 0);
        assert_eq!(session.backend().frames.len(), 2);
        assert_eq!(session.frames_encoded(), 1);
        assert_eq!(session.state(), SessionState::Running);
    }

    #[test]
    fn test_userdata() {
        let mut session = session(SoftwareProcessor);
        let res = Resolution::from((320, 240));
        session.init(config(320, 240)).unwrap();
        let data = nv12(res);

        session.request(ChangeRequest::Userdata {
            data: b"once".to_vec(),
            every_frame: false,
        });
        for ts in 0..2 {
            session
                .process(&frame(&data, res, ts), Default::default())
                .unwrap();
        }

        session.request(ChangeRequest::Userdata {
            data: b"always".to_vec(),
            every_frame: true,
        });
        for ts in 2..4 {
            session
                .process(&frame(&data, res, ts), Default::default())
                .unwrap();
        }

        let oversized = session.request(ChangeRequest::Userdata {
            data: vec![0; MAX_USERDATA_LEN + 1],
            every_frame: false,
        });
        session
            .process(&frame(&data, res, 4), Default::default())
            .unwrap();
        assert!(matches!(
            oversized.wait(),
            Err(EncodeError::Config(ConfigError::Userdata(1025)))
        ));

        let userdata = session
            .backend()
            .frames
            .iter()
            .map(|f| f.userdata.clone())
            .collect::<Vec<_>>();
        assert_eq!(
            userdata,
            vec![
                Some(b"once".to_vec()),
                None,
                Some(b"always".to_vec()),
                Some(b"always".to_vec()),
                Some(b"always".to_vec()),
            ]
        );
    }

    #[test]
    fn test_side_data_reaches_codec() {
        let mut session = session(SoftwareProcessor);
        let res = Resolution::from((320, 240));
        session.init(config(320, 240)).unwrap();
        let data = nv12(res);

        session
            .set_osd_region(&OsdUpdate::enable(
                2,
                Rect::new(16, 16, 32, 16),
                vec![1; 32 * 16],
            ))
            .unwrap();
        session.set_osd_palette(&[0xff00ff00; 256]).unwrap();
        assert!(session.set_osd_palette(&[0; 16]).is_err());

        let mut mv = vec![0u8; 64];
        let debug = [0xde, 0xad];
        session
            .process(
                &frame(&data, res, 0),
                SideData {
                    motion_vectors: Some(&mut mv),
                    debug: Some(&debug),
                    thumbnails: false,
                },
            )
            .unwrap();

        let sent = &session.backend().frames[0];
        assert_eq!(sent.osd_active, 3);
        assert_eq!(sent.osd, vec![(2, Rect::new(16, 16, 32, 16))]);
        assert_eq!(sent.debug, Some(debug.to_vec()));
        assert!(mv.iter().all(|&b| b == 1));
        assert!(matches!(
            session.backend().controls.last(),
            Some(ControlCommand::SetOsdPalette(_))
        ));
    }

    #[test]
    fn test_keyframe_request_and_rotation_lock() {
        let mut session = session(SoftwareProcessor);
        let res = Resolution::from((320, 240));
        session.init(config(320, 240)).unwrap();
        let data = nv12(res);

        let rotation = session.request(ChangeRequest::Rotation(Rotation::R180));
        session
            .process(&frame(&data, res, 0), Default::default())
            .unwrap();
        assert!(rotation.wait().is_ok());
        assert_eq!(session.codec_config().unwrap().rotation, Rotation::R180);

        let rotation = session.request(ChangeRequest::Rotation(Rotation::R0));
        let idr = session.request(ChangeRequest::ForceKeyframe);
        let packet = session
            .process(&frame(&data, res, 1), Default::default())
            .unwrap();
        assert!(matches!(
            rotation.wait(),
            Err(EncodeError::Config(ConfigError::RotationLocked))
        ));
        assert!(idr.wait().is_ok());
        assert!(packet.keyframe);
        assert_eq!(session.codec_config().unwrap().rotation, Rotation::R180);
    }

    #[test]
    fn test_resolution_change() {
        let mut session = session(SoftwareProcessor);
        let full = Resolution::from((1920, 1080));
        let small = Resolution::from((1280, 720));
        session.init(config(1920, 1080)).unwrap();

        session.request(ChangeRequest::Roi(vec![roi(0, 0), roi(1600, 0)]));
        let change = session.request(ChangeRequest::Resolution {
            resolution: small,
            hor_stride: 1280,
            ver_stride: 720,
        });

        let data = nv12(small);
        session
            .process(&frame(&data, small, 0), Default::default())
            .unwrap();
        assert!(change.wait().is_ok());
        assert_eq!(session.roi(), &[roi(0, 0)]);

        let data = nv12(full);
        assert!(matches!(
            session.process(&frame(&data, full, 1), Default::default()),
            Err(EncodeError::FrameMismatch(_))
        ));
    }

    #[test]
    fn test_changes_from_another_thread() {
        let mut session = session(SoftwareProcessor);
        let res = Resolution::from((320, 240));
        session.init(config(320, 240)).unwrap();
        let data = nv12(res);

        let sender = session.change_sender();
        let receipt = std::thread::spawn(move || sender.request(ChangeRequest::Gop(5)))
            .join()
            .unwrap();

        session
            .process(&frame(&data, res, 0), Default::default())
            .unwrap();
        assert!(receipt.wait().is_ok());
        assert_eq!(session.codec_config().unwrap().gop, 5);
    }
}
