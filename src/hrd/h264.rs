// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

//! The AVC (H.264) HRD timing model: continuous-time nominal removal time
//! and previous final arrival time, tracked directly in seconds.

use super::{target_delay, HrdInput, HrdModel};
use crate::params::BrcParams;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct H264Hrd {
    input: HrdInput,
    /// Nominal removal time of the current frame, in seconds.
    trn_cur: f64,
    /// Final arrival time of the previous frame, in seconds.
    taf_prv: f64,
    /// Last QP that produced an HRD violation for the frame being recoded.
    underflow_quant: Option<i32>,
}

impl H264Hrd {
    pub fn new(params: &BrcParams) -> Self {
        let mut input = HrdInput::new(params);
        // The H.264 model tracks clock tick in seconds, not 90kHz ticks.
        input.clock_tick /= 90_000.0;

        let mut hrd = H264Hrd {
            input,
            trn_cur: 0.0,
            taf_prv: 0.0,
            underflow_quant: None,
        };
        hrd.trn_cur = hrd.init_cpb_removal_delay(0) as f64 / 90_000.0;
        hrd
    }

    fn tai_cur(&self, enc_order: u64, is_key: bool) -> f64 {
        let init_delay = self.init_cpb_removal_delay(enc_order);
        let tai_earliest = if is_key {
            self.trn_cur - init_delay as f64 / 90_000.0
        } else {
            self.trn_cur - self.input.cpb_size_90k / 90_000.0
        };
        if self.input.cbr {
            self.taf_prv
        } else {
            self.taf_prv.max(tai_earliest)
        }
    }
}

impl HrdModel for H264Hrd {
    fn reset(&mut self, params: &BrcParams) {
        let fresh = HrdInput::new(params);
        self.input.bitrate = fresh.bitrate;
        self.input.cpb_size_90k = fresh.cpb_size_90k;
    }

    fn update(&mut self, size_in_bits: u64, enc_order: u64, is_key: bool) {
        let tai_cur = self.tai_cur(enc_order, is_key);
        self.taf_prv = tai_cur + size_in_bits as f64 / self.input.bitrate;
        self.trn_cur += self.input.clock_tick;
    }

    fn init_cpb_removal_delay(&self, _enc_order: u64) -> u32 {
        let delay = (self.trn_cur - self.taf_prv).max(0.0);
        let delay_90k = (90_000.0 * delay + 0.5) as u32;

        if delay_90k == 0 {
            1
        } else if !self.input.cbr && (delay_90k as f64) > self.input.cpb_size_90k {
            self.input.cpb_size_90k as u32
        } else {
            delay_90k
        }
    }

    fn init_cpb_removal_delay_offset(&self, enc_order: u64) -> u32 {
        (self.input.cpb_size_90k - self.init_cpb_removal_delay(enc_order) as f64) as u32
    }

    fn min_frame_size_bits(&self, enc_order: u64, _is_key: bool) -> u32 {
        let delay = self.init_cpb_removal_delay(enc_order) as f64;
        if !self.input.cbr || (delay + self.input.clock_tick * 90_000.0) < self.input.cpb_size_90k
        {
            return 0;
        }
        ((delay + self.input.clock_tick * 90_000.0 - self.input.cpb_size_90k) / 90_000.0
            * self.input.bitrate) as u32
            + 16
    }

    fn max_frame_size_bits(&self, enc_order: u64, is_key: bool) -> u32 {
        let tai_cur = self.tai_cur(enc_order, is_key);
        ((self.trn_cur - tai_cur) * self.input.bitrate) as u32
    }

    fn buffer_deviation(&self, enc_order: u64) -> f64 {
        let delay = self.init_cpb_removal_delay(enc_order) as f64;
        let target = target_delay(self.input.cpb_size_90k, self.input.init_cpb_removal_delay, !self.input.cbr);
        (target - delay) / 90_000.0 * self.input.bitrate
    }

    fn set_underflow_quant(&mut self, qp: i32) {
        self.underflow_quant = Some(qp);
    }

    fn reset_quant(&mut self) {
        self.underflow_quant = None;
    }

    fn min_quant(&self) -> i32 {
        self.underflow_quant.unwrap_or(i32::MIN)
    }

    fn max_quant(&self) -> i32 {
        self.underflow_quant.unwrap_or(i32::MAX)
    }
}
