// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Runtime parameter changes.
//!
//! Changes can be requested from any thread through a [`ChangeSender`]. They are queued and only
//! applied by the session at the start of the next frame, so a frame is always encoded with a
//! single consistent configuration. Each request hands back a [`ChangeReceipt`] through which the
//! outcome can be awaited.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::backend::SuperFrameConfig;
use crate::encoder::osd::OsdUpdate;
use crate::encoder::rate_control::RateSpec;
use crate::encoder::roi::RoiRegion;
use crate::encoder::EncodeError;
use crate::encoder::EncodeResult;
use crate::encoder::FrameRate;
use crate::encoder::QpConfig;
use crate::encoder::Rotation;
use crate::Resolution;

/// A change of encoding parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeRequest {
    FrameRate {
        input: FrameRate,
        output: FrameRate,
    },
    Bitrate(RateSpec),
    /// Rate control mode by name (`cbr`, `vbr`, `avbr`, `fixqp`) or hardware value.
    RcMode(String),
    Profile {
        profile: u32,
        level: u32,
    },
    Gop(u32),
    Resolution {
        resolution: Resolution,
        hor_stride: u32,
        ver_stride: u32,
    },
    Rotation(Rotation),
    /// Replaces the whole list of regions of interest.
    Roi(Vec<RoiRegion>),
    Osd(OsdUpdate),
    /// Userdata attached to the next frame only, or to every frame until replaced.
    Userdata {
        data: Vec<u8>,
        every_frame: bool,
    },
    ForceKeyframe,
    SuperFrame(SuperFrameConfig),
    Qp(QpConfig),
    MjpegQuality(u32),
}

impl ChangeRequest {
    pub fn name(&self) -> &'static str {
        match self {
            ChangeRequest::FrameRate { .. } => "frame rate",
            ChangeRequest::Bitrate(_) => "bitrate",
            ChangeRequest::RcMode(_) => "rate control mode",
            ChangeRequest::Profile { .. } => "profile",
            ChangeRequest::Gop(_) => "gop",
            ChangeRequest::Resolution { .. } => "resolution",
            ChangeRequest::Rotation(_) => "rotation",
            ChangeRequest::Roi(_) => "roi",
            ChangeRequest::Osd(_) => "osd",
            ChangeRequest::Userdata { .. } => "userdata",
            ChangeRequest::ForceKeyframe => "force keyframe",
            ChangeRequest::SuperFrame(_) => "super frame",
            ChangeRequest::Qp(_) => "qp",
            ChangeRequest::MjpegQuality(_) => "mjpeg quality",
        }
    }
}

/// Outcome of a change request, available once the session applied or rejected it.
#[derive(Debug)]
pub struct ChangeReceipt(mpsc::Receiver<EncodeResult<()>>);

impl ChangeReceipt {
    /// Blocks until the change has been processed.
    ///
    /// Returns [`EncodeError::ChangeDropped`] if the session went away without processing it.
    pub fn wait(self) -> EncodeResult<()> {
        self.0.recv().unwrap_or(Err(EncodeError::ChangeDropped))
    }

    /// Returns the outcome if the change has been processed already.
    pub fn try_result(&self) -> Option<EncodeResult<()>> {
        match self.0.try_recv() {
            Ok(result) => Some(result),
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => Some(Err(EncodeError::ChangeDropped)),
        }
    }
}

pub(crate) type PendingChange = (ChangeRequest, mpsc::Sender<EncodeResult<()>>);

#[derive(Debug, Default)]
pub(crate) struct ChangeQueue(Arc<Mutex<VecDeque<PendingChange>>>);

impl ChangeQueue {
    fn lock(&self) -> MutexGuard<'_, VecDeque<PendingChange>> {
        // A panicking requester cannot leave the queue in an inconsistent state.
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn push(&self, change: ChangeRequest) -> ChangeReceipt {
        let (tx, rx) = mpsc::channel();
        self.lock().push_back((change, tx));
        ChangeReceipt(rx)
    }

    /// Takes all the pending changes, in request order.
    pub(crate) fn drain(&self) -> Vec<PendingChange> {
        self.lock().drain(..).collect()
    }

    pub(crate) fn sender(&self) -> ChangeSender {
        ChangeSender(ChangeQueue(Arc::clone(&self.0)))
    }
}

/// Handle to request changes of a session, possibly from another thread.
#[derive(Debug)]
pub struct ChangeSender(ChangeQueue);

impl Clone for ChangeSender {
    fn clone(&self) -> Self {
        self.0.sender()
    }
}

impl ChangeSender {
    /// Queues `change` for the next frame.
    pub fn request(&self, change: ChangeRequest) -> ChangeReceipt {
        log::debug!("Queued {} change", change.name());
        self.0.push(change)
    }
}
