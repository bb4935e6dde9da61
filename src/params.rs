// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

//! Normalized, derived configuration for a BRC instance (§4.1).

use tracing::trace;

use crate::error::BrcError;
use crate::types::{
    ChromaFormat, CodecFamily, HrdConformance, PictureStructure, RateControlMethod, VideoParam,
};

/// Per-frame-type QP bounds in effect.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantRange {
    pub min: i32,
    pub max: i32,
}

/// Normalized, validated configuration. Immutable for the lifetime of a
/// reconfiguration epoch (see [`BrcCore::reset`](crate::core::BrcCore::reset)).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BrcParams {
    pub rate_control_method: RateControlMethod,
    pub codec: CodecFamily,
    pub field_mode: bool,

    pub target_bps: u64,
    pub max_bps: u64,

    pub frame_rate: f64,
    pub width: u32,
    pub height: u32,
    pub chroma_format: ChromaFormat,
    pub bit_depth_luma: u8,
    pub quant_offset: i32,

    pub hrd_conformance: HrdConformance,
    pub buffer_size_bytes: u64,
    pub initial_delay_bytes: u64,

    pub input_bits_per_frame: f64,
    pub max_input_bits_per_frame: f64,

    pub gop_size: u32,
    pub gop_ref_dist: u32,
    pub b_pyramid: bool,
    pub max_frame_size_bits: u32,

    pub quant_i: QuantRange,
    pub quant_p: QuantRange,
    pub quant_b: QuantRange,

    pub win_brc_size: u32,
    pub win_brc_max_avg_kbps: u32,
    pub mbbrc_enabled: bool,

    pub f_ab_period_long: f64,
    pub f_ab_period_short: f64,
    pub dq_ab_period: f64,
    pub b_ab_period: f64,

    pub recode_enabled: bool,
    pub panic_enabled: bool,
}

/// The largest `k < 16` such that `bitrate % 2^(7+k) == 0`, starting the
/// search at `k = 0` (HEVC `bit_rate_scale`).
fn hevc_bit_rate_scale(bitrate: u64) -> u32 {
    let mut scale = 0u32;
    while scale + 1 < 16 && bitrate & ((1u64 << (7 + scale + 1)) - 1) == 0 {
        scale += 1;
    }
    scale
}

/// The largest `k < 16` such that `cpb_size % 2^(5+k) == 0`, starting the
/// search at `k = 2` (HEVC `cpb_size_scale`).
fn hevc_cpb_size_scale(cpb_size: u64) -> u32 {
    let mut scale = 2u32;
    while scale + 1 < 16 && cpb_size & ((1u64 << (5 + scale + 1)) - 1) == 0 {
        scale += 1;
    }
    scale
}

fn round_down_to_multiple(value: u64, shift: u32) -> u64 {
    (value >> shift) << shift
}

impl BrcParams {
    pub fn is_field_mode(codec: CodecFamily, structure: PictureStructure) -> bool {
        codec == CodecFamily::Hevc && structure != PictureStructure::Progressive
    }

    /// Builds a normalized `BrcParams` from a caller-supplied `VideoParam`
    /// bag, or reports the first configuration error found.
    pub fn init(video_param: &VideoParam, field_mode: bool) -> Result<Self, BrcError> {
        if video_param.frame_rate_den == 0 || video_param.frame_rate_num == 0 {
            return Err(BrcError::InvalidVideoParam(
                "frame rate denominator/numerator must be nonzero".into(),
            ));
        }

        let k = video_param.brc_param_multiplier.max(1) as u64;
        let target_bps = k * video_param.target_kbps as u64 * 1000;
        let mut max_bps = k * video_param.max_kbps as u64 * 1000;

        max_bps = match video_param.rate_control_method {
            RateControlMethod::Cbr => target_bps,
            RateControlMethod::Vbr => max_bps.max(target_bps),
        };

        let raw_buffer_size_bytes = k * video_param.buffer_size_kb as u64 * 1000;

        let (bit_rate_scale, cpb_size_scale) = match video_param.codec {
            CodecFamily::Avc => (4, 2),
            CodecFamily::Hevc => (
                hevc_bit_rate_scale(max_bps),
                hevc_cpb_size_scale(raw_buffer_size_bytes),
            ),
        };

        // Only max_bps is re-quantized to the HRD unit; target_bps is left
        // as computed, matching brc_routines.cpp's cBRCParams::Init.
        max_bps = round_down_to_multiple(max_bps, 6 + bit_rate_scale);

        let hrd_conformance = match (
            video_param.coding_option.nal_hrd_conformance,
            video_param.coding_option.vui_nal_hrd_parameters,
        ) {
            (true, true) => HrdConformance::Strong,
            (true, false) => HrdConformance::Weak,
            _ => HrdConformance::None,
        };

        let mut recode_enabled = false;
        let mut panic_enabled = false;

        let (buffer_size_bytes, initial_delay_bytes) = if hrd_conformance.is_enabled() {
            recode_enabled = true;
            panic_enabled = hrd_conformance == HrdConformance::Strong;

            let buffer_size_bytes = round_down_to_multiple(raw_buffer_size_bytes, cpb_size_scale + 1);
            let initial_delay_bytes = round_down_to_multiple(
                k * video_param.initial_delay_kb as u64 * 1000,
                cpb_size_scale + 1,
            );
            (buffer_size_bytes, initial_delay_bytes)
        } else {
            (0, 0)
        };

        let frame_rate =
            video_param.frame_rate_num as f64 / video_param.frame_rate_den as f64;

        let bit_depth_luma = if video_param.bit_depth_luma == 0 {
            8
        } else {
            video_param.bit_depth_luma
        };
        let quant_offset = 6 * (bit_depth_luma as i32 - 8);

        let input_bits_per_frame = target_bps as f64 / frame_rate;
        let max_input_bits_per_frame = max_bps as f64 / frame_rate;

        let gop_mul = if field_mode { 2 } else { 1 };
        let gop_size = video_param.gop_size * gop_mul;
        let gop_ref_dist = video_param.gop_ref_dist * gop_mul;

        let b_pyramid = video_param.coding_option2.b_pyramid;
        let max_frame_size_bits = video_param.coding_option2.max_frame_size_bytes * 8;
        if max_frame_size_bits != 0 {
            recode_enabled = true;
            panic_enabled = true;
        }

        let (quant_i, quant_p, quant_b) = match video_param.coding_option2.qp_bounds {
            Some(b) if b.is_valid() => (
                QuantRange {
                    min: b.min_qp_i,
                    max: b.max_qp_i + quant_offset,
                },
                QuantRange {
                    min: b.min_qp_p,
                    max: b.max_qp_p + quant_offset,
                },
                QuantRange {
                    min: b.min_qp_b,
                    max: b.max_qp_b + quant_offset,
                },
            ),
            _ => {
                let default = QuantRange {
                    min: 1,
                    max: 51 + quant_offset,
                };
                (default, default, default)
            }
        };

        trace!(?hrd_conformance, target_bps, max_bps, "normalized brc params");

        Ok(BrcParams {
            rate_control_method: video_param.rate_control_method,
            codec: video_param.codec,
            field_mode,
            target_bps,
            max_bps,
            frame_rate,
            width: video_param.width,
            height: video_param.height,
            chroma_format: video_param.chroma_format,
            bit_depth_luma,
            quant_offset,
            hrd_conformance,
            buffer_size_bytes,
            initial_delay_bytes,
            input_bits_per_frame,
            max_input_bits_per_frame,
            gop_size,
            gop_ref_dist,
            b_pyramid,
            max_frame_size_bits,
            quant_i,
            quant_p,
            quant_b,
            win_brc_size: video_param.coding_option3.win_brc_size,
            win_brc_max_avg_kbps: video_param.coding_option3.win_brc_max_avg_kbps,
            mbbrc_enabled: video_param.coding_option3.mbbrc_enabled,
            f_ab_period_long: 100.0,
            f_ab_period_short: 6.0,
            dq_ab_period: 100.0,
            b_ab_period: 100.0,
            recode_enabled,
            panic_enabled,
        })
    }

    /// Compares against a freshly-derived `BrcParams` from `new_video_param`
    /// and decides what kind of reset is needed (§4.1).
    pub fn get_reset_type(
        &self,
        new_video_param: &VideoParam,
        new_sequence: bool,
    ) -> Result<ResetType, BrcError> {
        if new_sequence {
            return Ok(ResetType::default());
        }

        let new_params = BrcParams::init(new_video_param, self.field_mode)?;

        let incompatible = |field: &str| BrcError::IncompatibleVideoParam(field.into());

        if new_params.rate_control_method != self.rate_control_method {
            return Err(incompatible("rate_control_method"));
        }
        if new_params.hrd_conformance != self.hrd_conformance {
            return Err(incompatible("hrd_conformance"));
        }
        if new_params.frame_rate != self.frame_rate {
            return Err(incompatible("frame_rate"));
        }
        if new_params.width != self.width {
            return Err(incompatible("width"));
        }
        if new_params.height != self.height {
            return Err(incompatible("height"));
        }
        if new_params.chroma_format != self.chroma_format {
            return Err(incompatible("chroma_format"));
        }
        if new_params.bit_depth_luma != self.bit_depth_luma {
            return Err(incompatible("bit_depth_luma"));
        }

        let mut brc_reset = false;
        let mut sliding_window_reset = false;

        if self.hrd_conformance == HrdConformance::Strong {
            if new_params.buffer_size_bytes != self.buffer_size_bytes {
                return Err(incompatible("buffer_size_bytes"));
            }
            if new_params.initial_delay_bytes != self.initial_delay_bytes {
                return Err(incompatible("initial_delay_bytes"));
            }
            if new_params.target_bps != self.target_bps {
                return Err(incompatible("target_bps"));
            }
            if new_params.max_bps != self.max_bps {
                return Err(incompatible("max_bps"));
            }
        } else if new_params.target_bps != self.target_bps || new_params.max_bps != self.max_bps {
            brc_reset = true;
        }

        if new_params.win_brc_max_avg_kbps != self.win_brc_max_avg_kbps {
            brc_reset = true;
            sliding_window_reset = true;
        }
        if new_params.max_frame_size_bits != self.max_frame_size_bits {
            brc_reset = true;
        }
        if new_params.gop_size != self.gop_size {
            brc_reset = true;
        }
        if new_params.gop_ref_dist != self.gop_ref_dist {
            brc_reset = true;
        }
        if new_params.b_pyramid != self.b_pyramid {
            brc_reset = true;
        }
        if new_params.quant_i != self.quant_i
            || new_params.quant_p != self.quant_p
            || new_params.quant_b != self.quant_b
        {
            brc_reset = true;
        }

        Ok(ResetType {
            brc_reset,
            sliding_window_reset,
        })
    }

    pub fn quant_range(&self, picture_type: crate::types::PictureType) -> QuantRange {
        use crate::types::PictureType;
        match picture_type {
            PictureType::I => self.quant_i,
            PictureType::P => self.quant_p,
            PictureType::B => self.quant_b,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResetType {
    pub brc_reset: bool,
    pub sliding_window_reset: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use pretty_assertions::assert_eq;

    fn base_video_param() -> VideoParam {
        VideoParam {
            codec: CodecFamily::Avc,
            rate_control_method: RateControlMethod::Cbr,
            target_kbps: 1000,
            max_kbps: 1000,
            brc_param_multiplier: 0,
            initial_delay_kb: 500,
            buffer_size_kb: 1000,
            width: 640,
            height: 480,
            frame_rate_num: 30,
            frame_rate_den: 1,
            chroma_format: ChromaFormat::Yuv420,
            bit_depth_luma: 8,
            gop_size: 30,
            gop_ref_dist: 1,
            picture_structure: PictureStructure::Progressive,
            async_depth: 1,
            coding_option: CodingOption::default(),
            coding_option2: CodingOption2::default(),
            coding_option3: CodingOption3::default(),
            encoder_reset_option: EncoderResetOption::default(),
        }
    }

    #[test]
    fn hevc_scale_search_finds_the_largest_valid_divisor() {
        // 128 = 2^7: divisible by 2^(7+0) but not 2^(7+1), so scale is 0.
        assert_eq!(hevc_bit_rate_scale(128), 0);
        // 256 = 2^8: divisible by 2^(7+1) but not 2^(7+2), so scale is 1.
        assert_eq!(hevc_bit_rate_scale(256), 1);
        // 128 = 2^7: divisible by 2^(5+2) but not 2^(5+3), so scale is 2.
        assert_eq!(hevc_cpb_size_scale(128), 2);
        // 512 = 2^9: divisible by 2^(5+4) but not 2^(5+5), so scale is 4.
        assert_eq!(hevc_cpb_size_scale(512), 4);
    }

    #[test]
    fn cbr_forces_max_equal_target() {
        let vp = base_video_param();
        let params = BrcParams::init(&vp, false).unwrap();
        assert_eq!(params.target_bps, params.max_bps);
    }

    #[test]
    fn vbr_raises_max_to_target_when_smaller() {
        let mut vp = base_video_param();
        vp.rate_control_method = RateControlMethod::Vbr;
        vp.max_kbps = 500; // smaller than target
        let params = BrcParams::init(&vp, false).unwrap();
        assert!(params.max_bps >= params.target_bps);
    }

    #[test]
    fn zero_frame_rate_denominator_is_invalid() {
        let mut vp = base_video_param();
        vp.frame_rate_den = 0;
        assert!(BrcParams::init(&vp, false).is_err());
    }

    #[test]
    fn default_qp_bounds_shift_max_by_quant_offset() {
        let mut vp = base_video_param();
        vp.bit_depth_luma = 10;
        let params = BrcParams::init(&vp, false).unwrap();
        assert_eq!(params.quant_offset, 12);
        assert_eq!(params.quant_i.max, 63);
        assert_eq!(params.quant_i.min, 1);
    }

    #[test]
    fn reset_is_idempotent_on_unchanged_params() {
        let vp = base_video_param();
        let params = BrcParams::init(&vp, false).unwrap();
        let reset = params.get_reset_type(&vp, false).unwrap();
        assert_eq!(reset, ResetType::default());
    }

    #[test]
    fn reset_flags_changed_target_bitrate_under_weak_hrd() {
        let mut vp = base_video_param();
        vp.coding_option.nal_hrd_conformance = true;
        vp.coding_option.vui_nal_hrd_parameters = false;
        let params = BrcParams::init(&vp, false).unwrap();
        assert_eq!(params.hrd_conformance, HrdConformance::Weak);

        let mut vp2 = vp;
        vp2.target_kbps = 2000;
        vp2.max_kbps = 2000;
        let reset = params.get_reset_type(&vp2, false).unwrap();
        assert!(reset.brc_reset);
        assert!(!reset.sliding_window_reset);
    }

    #[test]
    fn reset_rejects_changed_width_under_any_hrd() {
        let vp = base_video_param();
        let params = BrcParams::init(&vp, false).unwrap();
        let mut vp2 = vp;
        vp2.width = 1280;
        assert!(params.get_reset_type(&vp2, false).is_err());
    }

    #[test]
    fn new_sequence_never_resets() {
        let vp = base_video_param();
        let params = BrcParams::init(&vp, false).unwrap();
        let mut vp2 = vp;
        vp2.width = 99999;
        let reset = params.get_reset_type(&vp2, true).unwrap();
        assert_eq!(reset, ResetType::default());
    }
}
