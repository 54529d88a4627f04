// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy backend whose only purpose is to let the encoder
//! run so we can test it in isolation.
//!
//! It records everything it is given and produces packets that look enough like the real thing
//! for the packet post-processing to work on them: Annex B NAL units for H.264 and H.265, and
//! well-formed marker segments for MJPEG.

use std::collections::VecDeque;

use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::ControlCommand;
use crate::backend::EncoderBackend;
use crate::backend::FrameDescriptor;
use crate::backend::PacketDescriptor;
use crate::codec::jpeg::APP0;
use crate::codec::jpeg::COM;
use crate::codec::jpeg::EOI;
use crate::codec::jpeg::MARKER_PREFIX;
use crate::codec::jpeg::SOI;
use crate::codec::jpeg::SOS;
use crate::encoder::roi::RoiRegion;
use crate::encoder::CodecConfig;
use crate::encoder::CodecParams;
use crate::encoder::RcMode;
use crate::BlockingMode;
use crate::EncodedFormat;
use crate::PixelFormat;
use crate::Rect;
use crate::Resolution;
use crate::Timestamp;

const DQT: u8 = 0xdb;

/// Operations whose failure can be injected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Failure {
    Configure,
    Submit,
    Retrieve,
}

/// What the backend saw of a submitted frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameSummary {
    pub format: PixelFormat,
    pub resolution: Resolution,
    pub timestamp: Timestamp,
    pub eos: bool,
    pub roi: Vec<RoiRegion>,
    /// Number of active OSD regions and their placement.
    pub osd_active: u32,
    pub osd: Vec<(u32, Rect)>,
    pub userdata: Option<Vec<u8>>,
    pub debug: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
pub struct DummyBackend {
    pub opened: Option<EncodedFormat>,
    pub configs: Vec<CodecConfig>,
    pub frames: Vec<FrameSummary>,
    pub controls: Vec<ControlCommand>,
    pub close_count: usize,
    /// Number of upcoming frames for which no packet is produced.
    pub skip_packets: usize,
    failures: Vec<(Failure, usize)>,
    pending: VecDeque<PacketDescriptor>,
    since_keyframe: Option<u32>,
    idr_requested: bool,
}

impl DummyBackend {
    /// Makes the next `op` fail once `successes` calls of it succeeded.
    pub fn fail_after(&mut self, op: Failure, successes: usize) {
        self.failures.retain(|(f, _)| *f != op);
        self.failures.push((op, successes));
    }

    pub fn fail_next(&mut self, op: Failure) {
        self.fail_after(op, 0);
    }

    fn should_fail(&mut self, op: Failure) -> bool {
        let Some(pos) = self.failures.iter().position(|(f, _)| *f == op) else {
            return false;
        };
        match &mut self.failures[pos].1 {
            0 => {
                self.failures.remove(pos);
                true
            }
            n => {
                *n -= 1;
                false
            }
        }
    }

    fn config(&self) -> BackendResult<&CodecConfig> {
        self.configs.last().ok_or(BackendError::NotOpened)
    }

    /// A JPEG stream as the codec would produce it for a `resolution` picture, with a `scan_len`
    /// bytes entropy coded segment.
    pub fn jpeg_packet(&self, resolution: Resolution, scan_len: usize) -> Vec<u8> {
        jpeg_stream(resolution, scan_len, None, self.frames.len() as u8)
    }

    fn packet_len(config: &CodecConfig) -> usize {
        let len = match config.codec {
            CodecParams::Mjpeg(ref p) => {
                config.resolution.get_area() / 64 * p.qfactor() as usize / 100
            }
            _ if config.rc_mode == RcMode::FixQp => 1024,
            _ => {
                let fps = config.output_fps.ceil().max(1) as usize;
                config.bitrate.target_bps as usize / 8 / fps
            }
        };
        len.max(16)
    }
}

fn segment(out: &mut Vec<u8>, marker: u8, payload: &[u8]) {
    out.extend_from_slice(&[MARKER_PREFIX, marker]);
    out.extend_from_slice(&((payload.len() + 2) as u16).to_be_bytes());
    out.extend_from_slice(payload);
}

fn jpeg_stream(
    resolution: Resolution,
    scan_len: usize,
    userdata: Option<&[u8]>,
    seed: u8,
) -> Vec<u8> {
    let mut out = vec![MARKER_PREFIX, SOI];
    segment(
        &mut out,
        APP0,
        &[b'J', b'F', b'I', b'F', 0, 1, 1, 0, 0, 1, 0, 1, 0, 0],
    );
    if let Some(userdata) = userdata {
        segment(&mut out, COM, userdata);
    }
    segment(&mut out, DQT, &[seed; 65]);

    let mut sof = vec![8];
    sof.extend_from_slice(&(resolution.height as u16).to_be_bytes());
    sof.extend_from_slice(&(resolution.width as u16).to_be_bytes());
    sof.extend_from_slice(&[1, 1, 0x11, 0]);
    segment(&mut out, 0xc0, &sof);

    segment(&mut out, SOS, &[1, 1, 0, 0, 0x3f, 0]);
    // Entropy coded data never contains a bare 0xff.
    out.extend((0..scan_len).map(|i| ((i + seed as usize) % 0xfe) as u8));
    out.extend_from_slice(&[MARKER_PREFIX, EOI]);
    out
}

fn annexb_stream(
    format: EncodedFormat,
    keyframe: bool,
    len: usize,
    userdata: Option<&[u8]>,
) -> Vec<u8> {
    const START_CODE: [u8; 4] = [0, 0, 0, 1];
    let (sei, slice): (&[u8], &[u8]) = match (format, keyframe) {
        (EncodedFormat::H265, true) => (&[0x4e, 0x01], &[0x26, 0x01]),
        (EncodedFormat::H265, false) => (&[0x4e, 0x01], &[0x02, 0x01]),
        (_, true) => (&[0x06], &[0x65]),
        (_, false) => (&[0x06], &[0x41]),
    };

    let mut out = Vec::with_capacity(len + 64);
    if let Some(userdata) = userdata {
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(sei);
        out.extend_from_slice(userdata);
    }
    out.extend_from_slice(&START_CODE);
    out.extend_from_slice(slice);
    let header_len = out.len();
    out.resize(header_len.max(len), 0x5a);
    out
}

impl EncoderBackend for DummyBackend {
    fn open(&mut self, format: EncodedFormat, _: BlockingMode) -> BackendResult<()> {
        self.opened = Some(format);
        Ok(())
    }

    fn configure(&mut self, config: &CodecConfig) -> BackendResult<()> {
        let format = self.opened.ok_or(BackendError::NotOpened)?;
        if config.format() != format {
            return Err(BackendError::UnsupportedCodec(config.format()));
        }
        if self.should_fail(Failure::Configure) {
            return Err(BackendError::Configure("injected failure".into()));
        }

        self.configs.push(config.clone());
        self.since_keyframe = None;
        Ok(())
    }

    fn submit_frame(&mut self, frame: FrameDescriptor<'_>) -> BackendResult<()> {
        self.opened.ok_or(BackendError::NotOpened)?;
        let config = self.config()?.clone();
        if self.should_fail(Failure::Submit) {
            return Err(BackendError::Submit("injected failure".into()));
        }
        if frame.format != config.input_format
            || frame.resolution != config.resolution
            || frame.hor_stride != config.hor_stride
            || frame.ver_stride != config.ver_stride
        {
            return Err(BackendError::Submit(format!(
                "frame {:?} {} does not match the configuration",
                frame.format, frame.resolution
            )));
        }
        let needed = frame.format.frame_size(frame.hor_stride, frame.ver_stride);
        if frame.data.len() < needed {
            return Err(BackendError::Submit(format!(
                "frame of {} bytes, {needed} expected",
                frame.data.len()
            )));
        }

        let side = frame.side;
        self.frames.push(FrameSummary {
            format: frame.format,
            resolution: frame.resolution,
            timestamp: frame.timestamp,
            eos: frame.eos,
            roi: side.roi.to_vec(),
            osd_active: side.osd.as_ref().map_or(0, |set| set.num_active),
            osd: side
                .osd
                .iter()
                .flat_map(|set| set.regions.iter().map(|r| (r.id, r.rect)))
                .collect(),
            userdata: side.userdata.map(<[u8]>::to_vec),
            debug: side.debug.map(<[u8]>::to_vec),
        });
        if let Some(mv) = side.motion_vectors {
            mv.fill(self.frames.len() as u8);
        }

        let keyframe = match self.since_keyframe {
            Some(n) if n + 1 < config.gop && !self.idr_requested => {
                self.since_keyframe = Some(n + 1);
                false
            }
            _ => {
                self.since_keyframe = Some(0);
                self.idr_requested = false;
                true
            }
        };

        if self.skip_packets > 0 {
            self.skip_packets -= 1;
            return Ok(());
        }

        let len = Self::packet_len(&config);
        let mut data = match config.format() {
            EncodedFormat::MJPEG => jpeg_stream(
                config.resolution,
                len,
                side.userdata,
                self.frames.len() as u8,
            ),
            format => annexb_stream(format, keyframe, len, side.userdata),
        };
        data.truncate(config.output_buffer_size);

        self.pending.push_back(PacketDescriptor {
            data,
            keyframe: keyframe || config.format() == EncodedFormat::MJPEG,
            temporal_id: 0,
            timestamp: frame.timestamp,
            eos: frame.eos,
        });

        Ok(())
    }

    fn retrieve_packet(&mut self, _: BlockingMode) -> BackendResult<Option<PacketDescriptor>> {
        self.opened.ok_or(BackendError::NotOpened)?;
        if self.should_fail(Failure::Retrieve) {
            return Err(BackendError::Retrieve("injected failure".into()));
        }
        Ok(self.pending.pop_front())
    }

    fn control(&mut self, command: ControlCommand) -> BackendResult<()> {
        self.opened.ok_or(BackendError::NotOpened)?;
        if command == ControlCommand::RequestIdr {
            self.idr_requested = true;
        }
        self.controls.push(command);
        Ok(())
    }

    fn close(&mut self) {
        self.opened = None;
        self.pending.clear();
        self.close_count += 1;
    }
}

