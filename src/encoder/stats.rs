// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Observed output bitrate and frame rate.
//!
//! Statistics are gathered over windows of as many frames as the output frame rate, i.e. about
//! one second, and recomputed from wall clock time once per window. They are purely informative.

use std::time::Instant;

/// Measurements of the last complete window.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Statistics {
    pub bits_per_second: u64,
    pub frames_per_second: f64,
    /// Number of frames the measurement covers.
    pub frames: u32,
}

#[derive(Debug)]
pub struct EncoderStats {
    window: u32,
    frames: u32,
    bytes: u64,
    window_start: Option<Instant>,
    last: Option<Statistics>,
}

impl EncoderStats {
    /// Creates statistics computed every `window` frames.
    pub fn new(window: u32) -> Self {
        Self {
            window: window.max(1),
            frames: 0,
            bytes: 0,
            window_start: None,
            last: None,
        }
    }

    /// Changes the window size. The current window restarts.
    pub fn set_window(&mut self, window: u32) {
        self.window = window.max(1);
        self.frames = 0;
        self.bytes = 0;
        self.window_start = None;
    }

    /// Records a `bytes` long packet produced now.
    pub fn record(&mut self, bytes: usize) {
        self.record_at(bytes, Instant::now());
    }

    /// Records a `bytes` long packet produced at `now`.
    pub fn record_at(&mut self, bytes: usize, now: Instant) {
        let start = *self.window_start.get_or_insert(now);
        self.frames += 1;
        self.bytes += bytes as u64;

        if self.frames < self.window {
            return;
        }

        let elapsed = now.duration_since(start).as_secs_f64();
        if elapsed > 0.0 {
            let stats = Statistics {
                bits_per_second: (self.bytes as f64 * 8.0 / elapsed) as u64,
                frames_per_second: self.frames as f64 / elapsed,
                frames: self.frames,
            };
            log::debug!(
                "Encoder statistics: bps={} fps={:.2} frames={}",
                stats.bits_per_second,
                stats.frames_per_second,
                stats.frames
            );
            self.last = Some(stats);
        }

        self.frames = 0;
        self.bytes = 0;
        self.window_start = Some(now);
    }

    /// Statistics of the last complete window, if any.
    pub fn current(&self) -> Option<Statistics> {
        self.last
    }
}
