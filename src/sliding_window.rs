// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

//! A bounded-window limiter that caps the average bitrate over the last
//! `WinBRCSize` frames, independent of the HRD's own buffer model.

use std::collections::VecDeque;

/// Relaxes the window cap for the first frame of a scene, or the first
/// recode attempt, so a single hard cut doesn't get clipped by the trailing
/// average of the quiet scene before it.
const RELAXED_CAP_FACTOR: u64 = 2;

#[derive(Debug, Clone)]
pub struct SlidingWindowLimiter {
    window_frames: usize,
    max_bits_per_frame_in_window: u64,
    default_bits_per_frame: u64,
    // Oldest frame at the front, most recent at the back.
    ring: VecDeque<u64>,
    sum: u64,
}

impl SlidingWindowLimiter {
    /// `max_avg_kbps` is the cap on the trailing average bitrate; `frame_rate`
    /// and `default_bits_per_frame` set the per-frame cap and the seed value
    /// used before the window has filled.
    pub fn new(window_frames: u32, max_avg_kbps: u64, frame_rate: f64, default_bits_per_frame: u64) -> Self {
        let max_bits_per_frame_in_window = (max_avg_kbps as f64 * 1000.0 / frame_rate) as u64;
        SlidingWindowLimiter {
            window_frames: window_frames.max(1) as usize,
            max_bits_per_frame_in_window,
            default_bits_per_frame,
            ring: VecDeque::with_capacity(window_frames.max(1) as usize),
            sum: 0,
        }
    }

    pub fn update_sliding_window(
        &mut self,
        coded_bits: u64,
        _enc_order: u64,
        _is_panic: bool,
        _is_scene_head: bool,
        _num_recode: u32,
    ) {
        self.ring.push_back(coded_bits);
        self.sum += coded_bits;

        while self.ring.len() > self.window_frames {
            let oldest = self.ring.pop_front().unwrap();
            self.sum -= oldest;
        }
    }

    /// The largest size, in bits, the frame currently being sized may
    /// consume without pushing the trailing window average over the cap.
    /// Panicking frames are reported as unlimited; scene-head and
    /// first-recode frames get a relaxed floor so a single cut isn't
    /// throttled by the quiet scene preceding it.
    pub fn get_max_frame_size(&self, is_panic: bool, is_scene_head: bool, num_recode: u32) -> u64 {
        if is_panic {
            return u64::MAX;
        }

        let cap_total = self.window_frames as u64 * self.max_bits_per_frame_in_window;

        // If the window is already full, the incoming frame displaces the
        // oldest entry; otherwise it's simply appended.
        let sum_after_eviction = if self.ring.len() >= self.window_frames {
            self.sum - *self.ring.front().unwrap_or(&0)
        } else {
            self.sum
        };

        let allowed = cap_total.saturating_sub(sum_after_eviction);

        if is_scene_head || num_recode == 0 {
            allowed.max(self.default_bits_per_frame * RELAXED_CAP_FACTOR)
        } else {
            allowed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_and_evicts_the_window() {
        let mut w = SlidingWindowLimiter::new(3, 1000, 30.0, 10_000);
        assert_eq!(w.ring.len(), 0);

        w.update_sliding_window(5_000, 0, false, false, 0);
        w.update_sliding_window(5_000, 1, false, false, 0);
        w.update_sliding_window(5_000, 2, false, false, 0);
        assert_eq!(w.sum, 15_000);

        w.update_sliding_window(5_000, 3, false, false, 0);
        assert_eq!(w.ring.len(), 3);
        assert_eq!(w.sum, 15_000);
    }

    #[test]
    fn panic_frames_are_unlimited() {
        let w = SlidingWindowLimiter::new(5, 1000, 30.0, 10_000);
        assert_eq!(w.get_max_frame_size(true, false, 3), u64::MAX);
    }

    #[test]
    fn cap_shrinks_as_window_fills_with_large_frames() {
        let mut w = SlidingWindowLimiter::new(2, 1000, 30.0, 10_000);
        let max_bits_per_frame = (1000.0 * 1000.0 / 30.0) as u64;

        let initial = w.get_max_frame_size(false, false, 1);
        assert_eq!(initial, 2 * max_bits_per_frame);

        w.update_sliding_window(max_bits_per_frame, 0, false, false, 0);
        let after_one = w.get_max_frame_size(false, false, 1);
        assert!(after_one < initial);
    }

    #[test]
    fn scene_head_gets_relaxed_floor() {
        let mut w = SlidingWindowLimiter::new(2, 10, 30.0, 10_000);
        // Fill the window with large frames so the raw cap collapses to ~0.
        w.update_sliding_window(1_000_000, 0, false, false, 0);
        w.update_sliding_window(1_000_000, 1, false, false, 0);

        let relaxed = w.get_max_frame_size(false, true, 1);
        assert!(relaxed >= 10_000 * RELAXED_CAP_FACTOR);
    }
}
