// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

//! The HEVC HRD timing model: buffering-period-relative nominal removal
//! time, tracked in 90kHz ticks with explicit MSB wraparound handling.

use super::{target_delay, HrdInput, HrdModel};
use crate::params::BrcParams;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HevcHrd {
    input: HrdInput,
    prev_au_cpb_removal_delay_minus1: i64,
    prev_au_cpb_removal_delay_msb: u64,
    prev_au_final_arrival_time: f64,
    prev_bp_au_nominal_removal_time: f64,
    prev_bp_enc_order: u64,
    underflow_quant: Option<i32>,
}

impl HevcHrd {
    pub fn new(params: &BrcParams) -> Self {
        let input = HrdInput::new(params);
        HevcHrd {
            prev_bp_au_nominal_removal_time: input.init_cpb_removal_delay,
            input,
            prev_au_cpb_removal_delay_minus1: -1,
            prev_au_cpb_removal_delay_msb: 0,
            prev_au_final_arrival_time: 0.0,
            prev_bp_enc_order: 0,
        }
    }

    fn au_nominal_removal_time(&self, enc_order: u64) -> f64 {
        if enc_order == 0 {
            return self.input.init_cpb_removal_delay;
        }

        let cpb_removal_delay_minus1 = (enc_order - self.prev_bp_enc_order) as i64 - 1;
        self.prev_bp_au_nominal_removal_time
            + self.input.clock_tick * (cpb_removal_delay_minus1 as f64 + 1.0)
    }
}

impl HrdModel for HevcHrd {
    fn reset(&mut self, params: &BrcParams) {
        let fresh = HrdInput::new(params);
        self.input.bitrate = fresh.bitrate;
        self.input.cpb_size_90k = fresh.cpb_size_90k;
    }

    fn update(&mut self, size_in_bits: u64, enc_order: u64, is_key: bool) {
        let au_nominal_removal_time = if enc_order > 0 {
            let cpb_removal_delay_minus1 = (enc_order - self.prev_bp_enc_order) as i64 - 1;

            let msb = if !is_key && enc_order - self.prev_bp_enc_order != 1 {
                if cpb_removal_delay_minus1 <= self.prev_au_cpb_removal_delay_minus1 {
                    self.prev_au_cpb_removal_delay_msb + self.input.max_cpb_removal_delay as u64
                } else {
                    self.prev_au_cpb_removal_delay_msb
                }
            } else {
                0
            };

            self.prev_au_cpb_removal_delay_msb = msb;
            self.prev_au_cpb_removal_delay_minus1 = cpb_removal_delay_minus1;

            let delay_val_minus1 = msb as f64 + cpb_removal_delay_minus1 as f64;
            self.prev_bp_au_nominal_removal_time + self.input.clock_tick * (delay_val_minus1 + 1.0)
        } else {
            self.input.init_cpb_removal_delay
        };

        let init_arrival_time = if self.input.cbr {
            self.prev_au_final_arrival_time
        } else {
            let init_delay = self.init_cpb_removal_delay(enc_order) as f64;
            let earliest = if is_key {
                au_nominal_removal_time - init_delay
            } else {
                au_nominal_removal_time - self.input.cpb_size_90k
            };
            self.prev_au_final_arrival_time.max(earliest * self.input.bitrate)
        };

        let au_final_arrival_time = init_arrival_time + size_in_bits as f64 * 90_000.0;
        self.prev_au_final_arrival_time = au_final_arrival_time;

        if is_key {
            self.prev_bp_au_nominal_removal_time = au_nominal_removal_time;
            self.prev_bp_enc_order = enc_order;
        }
    }

    fn init_cpb_removal_delay(&self, enc_order: u64) -> u32 {
        if enc_order == 0 {
            return self.input.init_cpb_removal_delay as u32;
        }

        let au_nominal_removal_time = self.au_nominal_removal_time(enc_order);
        let delta_time_90k =
            au_nominal_removal_time - self.prev_au_final_arrival_time / self.input.bitrate;

        if self.input.cbr {
            delta_time_90k as u32
        } else {
            delta_time_90k.min(self.input.cpb_size_90k) as u32
        }
    }

    fn min_frame_size_bits(&self, enc_order: u64, _is_key: bool) -> u32 {
        let delay = self.init_cpb_removal_delay(enc_order) as f64;
        if !self.input.cbr || (delay + self.input.clock_tick + 16.0) < self.input.cpb_size_90k {
            return 0;
        }
        ((delay + self.input.clock_tick + 16.0 - self.input.cpb_size_90k) / 90_000.0
            * self.input.bitrate
            + 0.99999) as u32
    }

    fn max_frame_size_bits(&self, enc_order: u64, _is_key: bool) -> u32 {
        (self.init_cpb_removal_delay(enc_order) as f64 / 90_000.0 * self.input.bitrate) as u32
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;

    fn hevc_params() -> BrcParams {
        let vp = VideoParam {
            codec: CodecFamily::Hevc,
            rate_control_method: RateControlMethod::Cbr,
            target_kbps: 2000,
            max_kbps: 2000,
            brc_param_multiplier: 0,
            initial_delay_kb: 1000,
            buffer_size_kb: 2000,
            width: 1920,
            height: 1080,
            frame_rate_num: 30,
            frame_rate_den: 1,
            chroma_format: ChromaFormat::Yuv420,
            bit_depth_luma: 8,
            gop_size: 30,
            gop_ref_dist: 1,
            picture_structure: PictureStructure::Progressive,
            async_depth: 1,
            coding_option: CodingOption {
                nal_hrd_conformance: true,
                vui_nal_hrd_parameters: true,
            },
            coding_option2: CodingOption2::default(),
            coding_option3: CodingOption3::default(),
            encoder_reset_option: EncoderResetOption::default(),
        };
        BrcParams::init(&vp, false).unwrap()
    }

    #[test]
    fn init_cpb_removal_delay_is_nonzero_for_first_frame() {
        let hrd = HevcHrd::new(&hevc_params());
        assert!(hrd.init_cpb_removal_delay(0) > 0);
    }

    #[test]
    fn update_advances_buffer_state() {
        let mut hrd = HevcHrd::new(&hevc_params());
        let before = hrd.init_cpb_removal_delay(0);
        hrd.update(33_000, 0, true);
        let after = hrd.max_frame_size_bits(1, false);
        assert!(before > 0);
        assert!(after > 0);
    }
}
