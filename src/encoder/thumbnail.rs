// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Thumbnails embedded in JPEG packets.
//!
//! Every thumbnail is produced by cropping and scaling the source picture through the
//! [`ImageProcessor`], then running it through the codec as a single-shot encode at the thumbnail
//! resolution. The codec is always switched back to the primary configuration afterwards.
//!
//! An [`ThumbnailKind::App1`] thumbnail goes into an EXIF segment, [`ThumbnailKind::App2`] ones are
//! appended to the packet and indexed by an MPF segment.

use thiserror::Error;

use crate::backend::BackendError;
use crate::backend::EncoderBackend;
use crate::backend::FrameDescriptor;
use crate::buffer_pool::BufferPool;
use crate::codec::jpeg::exif;
use crate::codec::jpeg::mpf;
use crate::codec::jpeg::mpf::MpImage;
use crate::encoder::CodecConfig;
use crate::encoder::ConfigError;
use crate::image_processing::BlitError;
use crate::image_processing::BlitFormat;
use crate::image_processing::ImageProcessor;
use crate::image_processing::ImageView;
use crate::image_processing::OwnedImage;
use crate::utils::align_up;
use crate::BlockingMode;
use crate::EncodedFormat;
use crate::PixelFormat;
use crate::Rect;
use crate::Resolution;

pub const MAX_THUMBNAIL_SLOTS: usize = 3;

/// Resolution of the EXIF thumbnail.
pub const APP1_RESOLUTION: Resolution = Resolution {
    width: 160,
    height: 120,
};

#[derive(Debug, Error)]
pub enum ThumbnailError {
    #[error("no thumbnail slot {0}")]
    NoSlot(usize),
    #[error("codec produced no packet for thumbnail slot {0}")]
    NoPacket(usize),
    #[error(transparent)]
    Blit(#[from] BlitError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("failed to restore the primary configuration: {0}")]
    Restore(#[source] BackendError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThumbnailKind {
    /// EXIF thumbnail, fixed at [`APP1_RESOLUTION`].
    App1,
    /// MPF secondary image.
    App2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThumbnailSlot {
    pub kind: ThumbnailKind,
    pub resolution: Resolution,
}

impl ThumbnailSlot {
    pub fn app1() -> Self {
        Self {
            kind: ThumbnailKind::App1,
            resolution: APP1_RESOLUTION,
        }
    }

    pub fn app2(resolution: Resolution) -> Self {
        Self {
            kind: ThumbnailKind::App2,
            resolution,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ThumbnailConfig {
    pub slots: Vec<ThumbnailSlot>,
    /// Part of the picture the thumbnails show. Defaults to the whole picture.
    pub crop: Option<Rect>,
}

impl ThumbnailConfig {
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Crop rectangle applied to a `picture` sized source.
    pub fn crop_rect(&self, picture: Resolution) -> Rect {
        self.crop.unwrap_or_else(|| Rect::full(picture))
    }

    pub fn validate(&self, format: EncodedFormat, picture: Resolution) -> Result<(), ConfigError> {
        if self.is_empty() {
            return Ok(());
        }
        if format != EncodedFormat::MJPEG {
            return Err(ConfigError::Thumbnail(format!(
                "thumbnails require MJPEG output, not {format:?}"
            )));
        }
        if self.slots.len() > MAX_THUMBNAIL_SLOTS {
            return Err(ConfigError::Thumbnail(format!(
                "{} slots configured, at most {MAX_THUMBNAIL_SLOTS} supported",
                self.slots.len()
            )));
        }

        let crop = self.crop_rect(picture);
        if crop.width == 0 || crop.height == 0 || !crop.fits_in(picture) {
            return Err(ConfigError::Thumbnail(format!(
                "crop rectangle {crop:?} outside of {picture}"
            )));
        }

        for (index, slot) in self.slots.iter().enumerate() {
            let Resolution { width, height } = slot.resolution;
            match slot.kind {
                ThumbnailKind::App1 if index != 0 || slot.resolution != APP1_RESOLUTION => {
                    return Err(ConfigError::Thumbnail(format!(
                        "APP1 thumbnail must be slot 0 at {APP1_RESOLUTION}"
                    )));
                }
                ThumbnailKind::App2 => debug_assert!(
                    width > APP1_RESOLUTION.width && height > APP1_RESOLUTION.height,
                    "APP2 thumbnails are expected to be larger than {APP1_RESOLUTION}"
                ),
                _ => (),
            }
            if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
                return Err(ConfigError::Thumbnail(format!(
                    "slot {index} resolution {} must be even and not empty",
                    slot.resolution
                )));
            }
            if width >= crop.width || height >= crop.height {
                return Err(ConfigError::Thumbnail(format!(
                    "slot {index} resolution {} not smaller than crop {}",
                    slot.resolution,
                    crop.resolution()
                )));
            }
        }

        Ok(())
    }
}

/// What ended up in a packet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PackageReport {
    /// Whether an EXIF thumbnail was inserted.
    pub app1: bool,
    /// Number of MPF thumbnails appended.
    pub app2: usize,
    /// Whether some thumbnail bytes were cut to fit the packet.
    pub truncated: bool,
}

/// Produces the thumbnails of a session and splices them into JPEG packets.
#[derive(Debug)]
pub struct ThumbnailPackager {
    config: ThumbnailConfig,
    crop: Rect,
    pool: BufferPool,
}

impl ThumbnailPackager {
    /// Creates a packager for `picture` sized sources. `config` must have been validated.
    pub fn new(config: ThumbnailConfig, picture: Resolution, pool: BufferPool) -> Self {
        let crop = config.crop_rect(picture);
        Self { config, crop, pool }
    }

    fn encode_slot<B, P>(
        &self,
        backend: &mut B,
        processor: &mut P,
        primary: &CodecConfig,
        source: &ImageView,
        index: usize,
        slot: &ThumbnailSlot,
    ) -> Result<Vec<u8>, ThumbnailError>
    where
        B: EncoderBackend + ?Sized,
        P: ImageProcessor + ?Sized,
    {
        processor.check_format(source.format, BlitFormat::I420)?;

        let resolution = slot.resolution;
        let hor_stride = align_up(resolution.width, 16);
        let ver_stride = align_up(resolution.height, 16);
        let mut image = OwnedImage::alloc(
            &self.pool,
            BlitFormat::I420,
            resolution,
            hor_stride as usize,
            ver_stride as usize,
        )?;
        processor.crop(source, &mut image.view_mut(), self.crop)?;

        backend.configure(&primary.for_thumbnail(resolution, hor_stride, ver_stride))?;
        backend.submit_frame(FrameDescriptor {
            format: PixelFormat::I420,
            resolution,
            hor_stride,
            ver_stride,
            timestamp: Default::default(),
            data: image.buffer.as_slice(),
            eos: true,
            side: Default::default(),
        })?;

        let packet = backend
            .retrieve_packet(BlockingMode::Blocking)?
            .ok_or(ThumbnailError::NoPacket(index))?;

        log::debug!(
            "Encoded thumbnail slot={index} resolution={resolution} bytes={}",
            packet.data.len()
        );

        Ok(packet.data)
    }

    /// Encodes the thumbnail of slot `index` out of `source`.
    ///
    /// The primary configuration is pushed back to the codec whatever the outcome. Failing to do
    /// so is reported as [`ThumbnailError::Restore`].
    pub fn prepare<B, P>(
        &self,
        backend: &mut B,
        processor: &mut P,
        primary: &CodecConfig,
        source: &ImageView,
        index: usize,
    ) -> Result<Vec<u8>, ThumbnailError>
    where
        B: EncoderBackend + ?Sized,
        P: ImageProcessor + ?Sized,
    {
        let slot = self
            .config
            .slots
            .get(index)
            .ok_or(ThumbnailError::NoSlot(index))?;

        let result = self.encode_slot(backend, processor, primary, source, index, slot);

        match backend.configure(primary) {
            Ok(()) => result,
            Err(e) => {
                log::error!("Failed to restore the primary configuration: {e}");
                Err(ThumbnailError::Restore(e))
            }
        }
    }

    /// Generates every configured thumbnail of `source` and splices them into `packet`, without
    /// growing it beyond `capacity`.
    ///
    /// Thumbnails that fail are skipped. A failed APP2 thumbnail also skips all the following ones,
    /// since MPF images must be indexed contiguously. Only a failure to restore the primary
    /// configuration is returned as an error.
    pub fn package<B, P>(
        &self,
        backend: &mut B,
        processor: &mut P,
        primary: &CodecConfig,
        source: &ImageView,
        packet: &mut Vec<u8>,
        capacity: usize,
    ) -> Result<PackageReport, ThumbnailError>
    where
        B: EncoderBackend + ?Sized,
        P: ImageProcessor + ?Sized,
    {
        let mut report = PackageReport::default();
        let mut app1 = None;
        let mut app2 = Vec::new();
        let mut app2_failed = false;

        for (index, slot) in self.config.slots.iter().enumerate() {
            if slot.kind == ThumbnailKind::App2 && app2_failed {
                log::warn!("Skipping thumbnail slot {index} after a previous failure");
                continue;
            }

            match self.prepare(backend, processor, primary, source, index) {
                Ok(data) => match slot.kind {
                    ThumbnailKind::App1 => app1 = Some(data),
                    ThumbnailKind::App2 => app2.push((data, slot.resolution)),
                },
                Err(e @ ThumbnailError::Restore(_)) => return Err(e),
                Err(e) => {
                    log::warn!("Skipping thumbnail slot {index}: {e}");
                    if slot.kind == ThumbnailKind::App2 {
                        app2_failed = true;
                    }
                }
            }
        }

        if let Some(thumbnail) = app1 {
            match exif::insert_thumbnail(packet, capacity, &thumbnail) {
                Ok(_) => report.app1 = true,
                Err(e) => log::warn!("Dropping EXIF thumbnail: {e}"),
            }
        }

        if !app2.is_empty() {
            let images = app2
                .iter()
                .map(|(data, resolution)| MpImage {
                    data,
                    resolution: *resolution,
                })
                .collect::<Vec<_>>();

            match mpf::assemble(packet, capacity, &images) {
                Ok(mpf) => {
                    report.app2 = mpf.images - 1;
                    report.truncated = mpf.truncated;
                }
                Err(e) => log::warn!("Dropping MPF thumbnails: {e}"),
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::backend::dummy::Failure;
    use crate::codec::jpeg::mpf::MpIndex;
    use crate::codec::jpeg::Segments;
    use crate::codec::jpeg::APP1;
    use crate::encoder::mjpeg::MjpegParams;
    use crate::encoder::CodecParams;
    use crate::encoder::EncoderConfig;
    use crate::image_processing::tests::FailingProcessor;
    use crate::image_processing::SoftwareProcessor;

    const PICTURE: Resolution = Resolution {
        width: 640,
        height: 480,
    };

    fn primary_config() -> CodecConfig {
        EncoderConfig {
            resolution: PICTURE,
            hor_stride: 640,
            ver_stride: 480,
            codec: CodecParams::Mjpeg(MjpegParams::default()),
            ..Default::default()
        }
        .validate()
        .unwrap()
    }

    fn source_frame() -> OwnedImage {
        let pool = BufferPool::default();
        let mut image = OwnedImage::alloc(&pool, BlitFormat::NV12, PICTURE, 640, 480).unwrap();
        for (i, v) in image.buffer.as_mut_slice().iter_mut().enumerate() {
            *v = (i % 251) as u8;
        }
        image
    }

    fn packager(slots: Vec<ThumbnailSlot>) -> ThumbnailPackager {
        let config = ThumbnailConfig { slots, crop: None };
        config.validate(EncodedFormat::MJPEG, PICTURE).unwrap();
        ThumbnailPackager::new(config, PICTURE, BufferPool::default())
    }

    fn opened_backend(primary: &CodecConfig) -> DummyBackend {
        let mut backend = DummyBackend::default();
        backend
            .open(EncodedFormat::MJPEG, BlockingMode::Blocking)
            .unwrap();
        backend.configure(primary).unwrap();
        backend
    }

    #[test]
    fn test_slot_validation() {
        let mut config = ThumbnailConfig {
            slots: vec![ThumbnailSlot::app1(), ThumbnailSlot::app2((320, 240).into())],
            crop: None,
        };
        assert!(config.validate(EncodedFormat::MJPEG, PICTURE).is_ok());
        assert!(config.validate(EncodedFormat::H264, PICTURE).is_err());

        config.crop = Some(Rect::new(0, 0, 320, 240));
        assert!(matches!(
            config.validate(EncodedFormat::MJPEG, PICTURE),
            Err(ConfigError::Thumbnail(_))
        ));

        config.crop = Some(Rect::new(400, 0, 320, 240));
        assert!(config.validate(EncodedFormat::MJPEG, PICTURE).is_err());

        let misplaced = ThumbnailConfig {
            slots: vec![ThumbnailSlot::app2((320, 240).into()), ThumbnailSlot::app1()],
            crop: None,
        };
        assert!(misplaced.validate(EncodedFormat::MJPEG, PICTURE).is_err());

        let odd = ThumbnailConfig {
            slots: vec![ThumbnailSlot::app2((321, 240).into())],
            crop: None,
        };
        assert!(odd.validate(EncodedFormat::MJPEG, PICTURE).is_err());
    }

    #[test]
    fn test_prepare_restores_primary_config() {
        let primary = primary_config();
        let mut backend = opened_backend(&primary);
        let packager = packager(vec![ThumbnailSlot::app2((320, 240).into())]);
        let source = source_frame();

        let data = packager
            .prepare(&mut backend, &mut SoftwareProcessor, &primary, &source.view(), 0)
            .unwrap();
        assert!(Segments::new(&data).is_ok());

        let thumb_frame = backend.frames.last().unwrap();
        assert_eq!(thumb_frame.resolution, Resolution::from((320, 240)));
        assert!(thumb_frame.eos);
        assert_eq!(backend.configs.last(), Some(&primary));
    }

    #[test]
    fn test_prepare_restores_primary_config_on_blit_failure() {
        let primary = primary_config();
        let mut backend = opened_backend(&primary);
        let packager = packager(vec![ThumbnailSlot::app2((320, 240).into())]);
        let source = source_frame();

        assert!(matches!(
            packager.prepare(&mut backend, &mut FailingProcessor, &primary, &source.view(), 0),
            Err(ThumbnailError::Blit(_))
        ));
        assert!(backend.frames.is_empty());
        assert_eq!(backend.configs.last(), Some(&primary));
    }

    #[test]
    fn test_restore_failure_is_reported() {
        let primary = primary_config();
        let mut backend = opened_backend(&primary);
        let packager = packager(vec![ThumbnailSlot::app2((320, 240).into())]);
        let source = source_frame();

        // The thumbnail configuration goes through, the restore does not.
        backend.fail_after(Failure::Configure, 1);
        assert!(matches!(
            packager.prepare(&mut backend, &mut SoftwareProcessor, &primary, &source.view(), 0),
            Err(ThumbnailError::Restore(_))
        ));
    }

    #[test]
    fn test_package_exif_and_mpf() {
        let primary = primary_config();
        let mut backend = opened_backend(&primary);
        let packager = packager(vec![
            ThumbnailSlot::app1(),
            ThumbnailSlot::app2((320, 240).into()),
            ThumbnailSlot::app2((240, 180).into()),
        ]);
        let source = source_frame();

        let mut packet = backend.jpeg_packet(PICTURE, 600);
        let report = packager
            .package(
                &mut backend,
                &mut SoftwareProcessor,
                &primary,
                &source.view(),
                &mut packet,
                primary.output_buffer_size,
            )
            .unwrap();

        assert_eq!(
            report,
            PackageReport {
                app1: true,
                app2: 2,
                truncated: false
            }
        );
        assert!(Segments::new(&packet)
            .unwrap()
            .any(|s| s.is_ok_and(|s| s.marker == APP1)));
        assert_eq!(MpIndex::parse(&packet).unwrap().entries.len(), 3);
        assert_eq!(backend.configs.last(), Some(&primary));
    }

    #[test]
    fn test_failed_app2_skips_following_slots() {
        let primary = primary_config();
        let mut backend = opened_backend(&primary);
        let packager = packager(vec![
            ThumbnailSlot::app2((320, 240).into()),
            ThumbnailSlot::app2((240, 180).into()),
        ]);
        let source = source_frame();

        let mut packet = backend.jpeg_packet(PICTURE, 600);
        let original = packet.clone();
        let report = packager
            .package(
                &mut backend,
                &mut FailingProcessor,
                &primary,
                &source.view(),
                &mut packet,
                primary.output_buffer_size,
            )
            .unwrap();

        assert_eq!(report, PackageReport::default());
        assert_eq!(packet, original);
        // Only the first slot was attempted, and the primary configuration restored.
        assert_eq!(backend.configs.len(), 2);
        assert_eq!(backend.configs.last(), Some(&primary));
    }
}
