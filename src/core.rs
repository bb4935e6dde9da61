// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

//! The controller itself: QP selection on request, and the per-frame
//! recode/accept state machine driven by the coded size of each frame.

use tracing::trace;

use crate::context::{BrcContext, RecodeState};
use crate::error::{BrcError, BrcResult, HrdCheck, Verdict};
use crate::hrd::{HrdModel, HrdModelImpl};
use crate::params::{BrcParams, ResetType};
use crate::qstep::{qp_to_qstep, qstep_to_qp};
use crate::sliding_window::SlidingWindowLimiter;
use crate::types::{
    ChromaFormat, FrameCtrl, FrameParam, FrameStatus, FrameTypeFlags, PictureType,
    RateControlMethod, VideoParam,
};

/// Threshold on the `eRate` ratio between the current frame and the last
/// reference of the same kind, above which the current frame is treated as
/// a scene cut.
const SCENE_CHANGE_RATIO: f64 = 5.0;
/// Fallback value for the ratio when there's no previous `eRate` to divide
/// by (one more than [`SCENE_CHANGE_RATIO`], so a first frame never reads
/// as a scene change on its own).
const SCENE_CHANGE_RATIO_FALLBACK: f64 = 6.0;

const MB_BLOCK_SIZE: u32 = 16;

/// Running QP/HRD/window state plus the normalized params it was built
/// from; the thing a caller owns for the lifetime of one encode.
pub struct BrcCore {
    params: BrcParams,
    ctx: BrcContext,
    hrd: Option<HrdModelImpl>,
    window: Option<SlidingWindowLimiter>,
}

impl BrcCore {
    pub fn init(video_param: &VideoParam) -> BrcResult<Self> {
        let field_mode = BrcParams::is_field_mode(video_param.codec, video_param.picture_structure);
        let params = BrcParams::init(video_param, field_mode)?;

        let mut ctx = BrcContext::new();
        ctx.fab_long = params.input_bits_per_frame;
        ctx.fab_short = params.input_bits_per_frame;

        let raw_size = raw_frame_size_bits(params.width, params.height, params.chroma_format, params.bit_depth_luma);
        let qp = new_qp_from_sizes(
            raw_size,
            params.input_bits_per_frame,
            params.quant_i.min,
            params.quant_i.max,
            1,
            params.quant_offset,
            0.5,
            false,
            false,
        );
        update_qp_params(&mut ctx, qp, PictureType::I, 0, params.quant_i.min, params.quant_i.max);
        ctx.dquant_ab = 1.0 / qp.max(1) as f64;

        let hrd = params.hrd_conformance.is_enabled().then(|| HrdModelImpl::new(&params));
        let window = (params.win_brc_size != 0).then(|| {
            SlidingWindowLimiter::new(
                params.win_brc_size,
                params.win_brc_max_avg_kbps as u64,
                params.frame_rate,
                params.input_bits_per_frame as u64,
            )
        });

        trace!(qp, raw_size, "brc core initialized");

        Ok(BrcCore { params, ctx, hrd, window })
    }

    /// Applies a reconfiguration, either by closing and reopening the
    /// sequence (when the caller asks for a new one) or, for a compatible
    /// in-sequence change, recomputing QP/EMA state in place.
    pub fn reset(&mut self, video_param: &VideoParam) -> BrcResult<ResetType> {
        if video_param.encoder_reset_option.start_new_sequence {
            *self = Self::init(video_param)?;
            return Ok(ResetType::default());
        }

        let reset_type = self.params.get_reset_type(video_param, false)?;
        if reset_type.brc_reset {
            self.params = BrcParams::init(video_param, self.params.field_mode)?;

            let mut quant = (1.0 / self.ctx.dquant_ab * (self.ctx.fab_long / self.params.input_bits_per_frame).powf(0.32)
                + 0.5) as i32;
            quant = quant.clamp(self.params.quant_i.min, self.params.quant_i.max);
            update_qp_params(&mut self.ctx, quant, PictureType::I, 0, self.params.quant_i.min, self.params.quant_i.max);
            self.ctx.dquant_ab = 1.0 / quant as f64;
            self.ctx.fab_long = self.params.input_bits_per_frame;
            self.ctx.fab_short = self.params.input_bits_per_frame;

            if let Some(hrd) = &mut self.hrd {
                hrd.reset(&self.params);
            }

            if reset_type.sliding_window_reset {
                self.window = (self.params.win_brc_size != 0).then(|| {
                    SlidingWindowLimiter::new(
                        self.params.win_brc_size,
                        self.params.win_brc_max_avg_kbps as u64,
                        self.params.frame_rate,
                        self.params.input_bits_per_frame as u64,
                    )
                });
            }

            trace!(quant, "brc reset applied");
        }

        Ok(reset_type)
    }

    /// Selects the QP (and, if enabled, the HRD delay signaling and the
    /// per-block MBBRC map) for the frame about to be encoded.
    pub fn get_frame_ctrl(&self, frame_param: &FrameParam) -> FrameCtrl {
        let qp = if frame_param.encoded_order == self.ctx.enc_order {
            self.ctx.quant
        } else {
            let pic_type =
                derive_picture_type(frame_param.frame_type, frame_param.pyramid_layer, self.params.gop_ref_dist);
            current_qp_for_type(&self.ctx, pic_type, frame_param.pyramid_layer)
        };
        let qp_y = qp - self.params.quant_offset;

        let (initial_cpb_removal_delay, initial_cpb_removal_offset) = match &self.hrd {
            Some(hrd) => (
                Some(hrd.init_cpb_removal_delay(frame_param.encoded_order)),
                Some(hrd.init_cpb_removal_delay_offset(frame_param.encoded_order)),
            ),
            None => (None, None),
        };

        let mbqp_map = self.params.mbbrc_enabled.then(|| self.build_mbqp_map(qp));

        FrameCtrl { qp_y, initial_cpb_removal_delay, initial_cpb_removal_offset, mbqp_map }
    }

    fn build_mbqp_map(&self, qp: i32) -> Vec<u8> {
        let w_blk = self.params.width.div_ceil(MB_BLOCK_SIZE);
        let h_blk = self.params.height.div_ceil(MB_BLOCK_SIZE);
        (0..(w_blk * h_blk) as usize)
            .map(|i| (qp + if qp < 51 { (i % 2) as i32 } else { 0 }) as u8)
            .collect()
    }

    /// Reports the coded size of the frame just encoded and decides whether
    /// it stands (`Verdict::Ok`, possibly after updating the running QP for
    /// the next frame) or has to be recoded at a different QP.
    pub fn update(&mut self, frame_param: &FrameParam) -> BrcResult<(Verdict, FrameStatus)> {
        let params = self.params;
        let ctx = &mut self.ctx;
        let hrd = &mut self.hrd;
        let window = &mut self.window;

        if params.recode_enabled {
            if let RecodeState::AwaitingRecode { enc_order } = ctx.recode {
                if enc_order != frame_param.encoded_order || frame_param.num_recode == 0 {
                    return Err(BrcError::UndefinedBehavior { expected: enc_order, got: frame_param.encoded_order });
                }
            }
        }

        let layer = frame_param.pyramid_layer;
        let pic_type = derive_picture_type(frame_param.frame_type, layer, params.gop_ref_dist);
        let is_intra = pic_type == PictureType::I;
        let bits = frame_param.coded_frame_size_bytes * 8;
        let qp_y = frame_param.qp_y + params.quant_offset;

        let mut frame_status = FrameStatus::default();
        let mut b_sh_start = false;
        let mut b_need_update_qp = false;

        if frame_param.num_recode == 0 || ctx.enc_order != frame_param.encoded_order {
            if is_intra {
                ctx.last_i_enc_order = frame_param.encoded_order;
            }
            ctx.enc_order = frame_param.encoded_order;
            ctx.display_order = frame_param.display_order;
            ctx.recode = RecodeState::Idle;
            ctx.panic = false;

            let range = params.quant_range(pic_type);
            ctx.quant_min = range.min;
            ctx.quant_max = range.max;
            ctx.quant = qp_y;

            if ctx.in_scene_change && (ctx.display_order > ctx.sch_poc + 1 || ctx.display_order == 0) {
                ctx.persistent_since_ref = false;
            }

            b_need_update_qp = true;
            if let Some(hrd) = hrd.as_mut() {
                hrd.reset_quant();
            }
        }

        let qstep = qp_to_qstep(qp_y, params.quant_offset);
        let mut fab_long = ctx.fab_long + (bits as f64 - ctx.fab_long) / params.f_ab_period_long;
        let mut fab_short = ctx.fab_short + (bits as f64 - ctx.fab_short) / params.f_ab_period_short;
        let e_rate = bits as f64 * qstep.sqrt();

        let b_max_frame_size_mode = params.max_frame_size_bits != 0
            && params.rate_control_method == RateControlMethod::Vbr
            && (params.max_frame_size_bits as f64) < 2.0 * params.input_bits_per_frame
            && ctx.total_deviation < -1.0 * params.input_bits_per_frame * params.frame_rate;

        let e2pe = if is_intra {
            if ctx.e_rate_sh == 0.0 { SCENE_CHANGE_RATIO_FALLBACK } else { e_rate / ctx.e_rate_sh }
        } else if ctx.e_rate == 0.0 {
            SCENE_CHANGE_RATIO_FALLBACK
        } else {
            e_rate / ctx.e_rate
        };

        let mut hrd_check = HrdCheck::Ok;
        if params.hrd_conformance.is_enabled() {
            if let Some(hrd) = hrd.as_mut() {
                hrd_check = check_hrd_and_update_qp(hrd, bits, frame_param.encoded_order, is_intra, qp_y);
                if hrd_check != HrdCheck::Ok && ctx.panic {
                    return Err(BrcError::NotEnoughBuffer);
                }
                if hrd_check == HrdCheck::Ok && !ctx.panic {
                    b_need_update_qp = true;
                }
                frame_status.min_frame_size_bits = hrd.min_frame_size_bits(frame_param.encoded_order, is_intra);
            }
        }

        if e2pe > SCENE_CHANGE_RATIO {
            ctx.fab_long = params.input_bits_per_frame;
            ctx.fab_short = params.input_bits_per_frame;
            fab_long = ctx.fab_long + (bits as f64 - ctx.fab_long) / params.f_ab_period_long;
            fab_short = ctx.fab_short + (bits as f64 - ctx.fab_short) / params.f_ab_period_short;
            ctx.in_scene_change = true;

            if !matches!(pic_type, PictureType::B) {
                b_sh_start = true;
                ctx.persistent_since_ref = true;
                ctx.e_rate_sh = e_rate;
                ctx.dquant_ab = 1.0 / ctx.quant as f64;
                ctx.sch_poc = frame_param.display_order;
            }
        }

        let mut frame_size_lim = u64::MAX;
        if let Some(window) = window.as_ref() {
            frame_size_lim = frame_size_lim.min(window.get_max_frame_size(ctx.panic, b_sh_start || is_intra, frame_param.num_recode));
        }
        if params.max_frame_size_bits != 0 {
            frame_size_lim = frame_size_lim.min(params.max_frame_size_bits as u64);
        }

        if frame_param.num_recode < 2 {
            let target_frame_size = params.input_bits_per_frame.max(fab_long);
            let mult = if ctx.enc_order == 0 { 6.0 } else if b_sh_start || is_intra { 8.0 } else { 4.0 };
            let mut max_frame_size = mult * target_frame_size * if params.b_pyramid { 1.5 } else { 1.0 };

            let mut quant_max = ctx.quant_max;
            let mut quant_min = ctx.quant_min;
            let quant = qp_y;

            max_frame_size = max_frame_size.min(frame_size_lim as f64);

            if let Some(hrd) = hrd.as_ref() {
                let hrd_max = hrd.max_frame_size_bits(ctx.enc_order, is_intra) as f64;
                max_frame_size = if b_sh_start || is_intra {
                    max_frame_size.min(3.5 / 9.0 * hrd_max + 5.5 / 9.0 * target_frame_size)
                } else {
                    max_frame_size.min(2.5 / 9.0 * hrd_max + 6.5 / 9.0 * target_frame_size)
                };
                quant_max = quant_max.min(hrd.max_quant());
                quant_min = quant_min.max(hrd.min_quant());
            }
            max_frame_size = max_frame_size.max(target_frame_size);

            if bits as f64 > max_frame_size && quant < quant_max {
                let quant_new =
                    new_qp_from_sizes(bits as f64, max_frame_size, quant_min, quant_max, quant, params.quant_offset, 1.0, false, true);
                if quant_new > quant {
                    b_need_update_qp = false;
                    if quant_new > current_qp_for_type(ctx, pic_type, layer) {
                        let install_qp = if b_max_frame_size_mode { quant_new - 1 } else { quant_new };
                        update_qp_params(ctx, install_qp, pic_type, layer, quant_min, quant_max);
                        ctx.fab_long = params.input_bits_per_frame;
                        ctx.fab_short = params.input_bits_per_frame;
                        ctx.dquant_ab = 1.0 / quant_new as f64;
                    }
                    if params.recode_enabled {
                        let verdict = set_recode_params(Verdict::BigFrame, quant, quant_new, quant_min, quant_max, ctx)?;
                        return Ok((verdict, frame_status));
                    }
                }
            }

            if bits as f64 > max_frame_size
                && quant == quant_max
                && !is_intra
                && params.panic_enabled
                && !ctx.panic
                && is_frame_before_intra(ctx.enc_order, ctx.last_i_enc_order, params.gop_size, params.gop_ref_dist)
            {
                let verdict = set_recode_params(Verdict::PanicBigFrame, quant, quant, quant_min, quant_max, ctx)?;
                return Ok((verdict, frame_status));
            }

            if params.hrd_conformance.is_enabled() && frame_param.num_recode == 0 && quant < quant_max {
                if let Some(hrd) = hrd.as_ref() {
                    let hrd_max = hrd.max_frame_size_bits(frame_param.encoded_order, is_intra) as f64;
                    let fa_max = 1.0 / 9.0 * hrd_max + 8.0 / 9.0 * fab_long;
                    if fab_short > fa_max {
                        let quant_new =
                            new_qp_from_sizes(fab_short, fa_max, quant_min, quant_max, quant, params.quant_offset, 0.5, false, true);
                        if quant_new > quant {
                            b_need_update_qp = false;
                            if quant_new > current_qp_for_type(ctx, pic_type, layer) {
                                update_qp_params(ctx, quant_new, pic_type, layer, quant_min, quant_max);
                                ctx.fab_long = params.input_bits_per_frame;
                                ctx.fab_short = params.input_bits_per_frame;
                                ctx.dquant_ab = 1.0 / quant_new as f64;
                            }
                            if params.recode_enabled {
                                let verdict = set_recode_params(Verdict::BigFrame, quant, quant_new, quant_min, quant_max, ctx)?;
                                return Ok((verdict, frame_status));
                            }
                        }
                    }
                }
            }
        }

        let needs_recode = (params.hrd_conformance.is_enabled() && hrd_check != HrdCheck::Ok) || (bits as f64 > frame_size_lim as f64);
        if needs_recode && params.recode_enabled {
            let quant = ctx.quant;
            let (mut requested, target_size) = if bits as f64 > frame_size_lim as f64 {
                (Verdict::BigFrame, frame_size_lim as f64)
            } else if hrd_check == HrdCheck::Big {
                let max_f = hrd.as_ref().unwrap().max_frame_size_bits(frame_param.encoded_order, is_intra);
                (Verdict::BigFrame, max_f as f64 * 3.0 / 4.0)
            } else {
                let min_f = hrd.as_ref().unwrap().min_frame_size_bits(frame_param.encoded_order, is_intra);
                (Verdict::SmallFrame, min_f as f64 * 5.0 / 4.0)
            };

            if target_size == 0.0 {
                return Err(BrcError::InvalidVideoParam("hrd target frame size resolved to zero".into()));
            }

            let mut quant_new =
                new_qp_from_sizes(bits as f64, target_size, ctx.quant_min, ctx.quant_max, quant, params.quant_offset, 1.0, true, true);

            if quant_new != quant {
                if requested == Verdict::SmallFrame {
                    quant_new = quant_new.max(quant - 2);
                    requested = Verdict::PanicSmallFrame;
                }
                if (quant_new - qp_y) * (quant_new - current_qp_for_type(ctx, pic_type, layer)) > 0 {
                    update_qp_params(ctx, quant_new, pic_type, layer, ctx.quant_min, ctx.quant_max);
                }
                b_need_update_qp = false;
            }

            let verdict = set_recode_params(requested, quant, quant_new, ctx.quant_min, ctx.quant_max, ctx)?;
            return Ok((verdict, frame_status));
        }

        // Accepted: no further recode requested for this frame.
        let k_recip = 1.0 / ctx.quant as f64;
        let dq_ab_period = if matches!(ctx.recode, RecodeState::AwaitingRecode { .. }) {
            if k_recip < ctx.dquant_ab { 16.0 } else { 25.0 }
        } else {
            params.dq_ab_period
        };

        if b_need_update_qp {
            ctx.dquant_ab += (k_recip - ctx.dquant_ab) / dq_ab_period;
            ctx.dquant_ab = ctx.dquant_ab.clamp(1.0 / ctx.quant_max as f64, 1.0 / ctx.quant_min as f64);
            ctx.fab_long = fab_long;
            ctx.fab_short = fab_short;
        }

        let old_scene = ctx.persistent_since_ref
            && ctx.display_order < ctx.sch_poc
            && e2pe < 0.01
            && (bits as f64) < 1.5 * fab_long;

        if !matches!(pic_type, PictureType::B) {
            ctx.last_non_b_frame_size = bits;
            if is_intra {
                ctx.e_rate_sh = e_rate;
            } else {
                ctx.e_rate = e_rate;
            }
        }

        if let Some(window) = window.as_mut() {
            window.update_sliding_window(bits, ctx.enc_order, ctx.panic, b_sh_start || is_intra, frame_param.num_recode);
        }

        ctx.total_deviation += bits as f64 - params.input_bits_per_frame;

        if !ctx.panic && !old_scene && b_need_update_qp {
            let mut tot_dev = ctx.total_deviation;
            let mut hrd_dev = 0.0;
            let mut max_frame_size_hrd = 0.0;
            if let Some(hrd) = hrd.as_ref() {
                hrd_dev = hrd.buffer_deviation(frame_param.encoded_order);
                max_frame_size_hrd = hrd.max_frame_size_bits(frame_param.encoded_order, is_intra) as f64;
            }

            let dequant_new = ctx.dquant_ab * (params.input_bits_per_frame / ctx.fab_long).powf(1.2);
            let mut b_ab_period = params.b_ab_period;

            if params.hrd_conformance.is_enabled() {
                tot_dev = if params.rate_control_method == RateControlMethod::Vbr && params.max_bps > params.target_bps {
                    tot_dev.max(hrd_dev)
                } else {
                    hrd_dev
                };
                if tot_dev > 0.0 {
                    b_ab_period = (if params.b_pyramid { 4.0 } else { 3.0 }) * max_frame_size_hrd / fab_short
                        * get_ab_period_coeff(ctx.enc_order.saturating_sub(ctx.last_i_enc_order), params.gop_size);
                    b_ab_period = b_ab_period.clamp(params.b_ab_period / 10.0, params.b_ab_period);
                }
            }

            let mut quant_new = new_qp_from_deviation(
                tot_dev / b_ab_period / params.input_bits_per_frame,
                dequant_new,
                ctx.quant_min,
                ctx.quant_max,
                ctx.quant,
                params.b_pyramid && params.recode_enabled,
                b_sh_start && matches!(ctx.recode, RecodeState::Idle),
            );

            if b_max_frame_size_mode {
                let (factor_hi, factor_lo) = if b_sh_start || is_intra { (0.95, 0.9) } else { (0.9, 0.8) };
                let target_max = params.max_frame_size_bits as f64 * factor_hi;
                let target_min = params.max_frame_size_bits as f64 * factor_lo;
                let quant_new_min =
                    new_qp_from_sizes(bits as f64, target_max, ctx.quant_min, ctx.quant_max, ctx.quant, params.quant_offset, 1.0, false, false);
                let quant_new_max =
                    new_qp_from_sizes(bits as f64, target_min, ctx.quant_min, ctx.quant_max, ctx.quant, params.quant_offset, 1.0, false, false);

                let mut quant_corrected = ctx.quant;
                if quant_corrected < quant_new_min - 3 {
                    quant_corrected += 2;
                }
                if quant_corrected < quant_new_min {
                    quant_corrected += 1;
                } else if quant_corrected > quant_new_max + 3 {
                    quant_corrected -= 2;
                } else if quant_corrected > quant_new_max {
                    quant_corrected -= 1;
                }
                quant_new = quant_corrected.clamp(ctx.quant_min, ctx.quant_max);
            }

            if (quant_new - ctx.quant) * (quant_new - current_qp_for_type(ctx, pic_type, layer)) > 0 {
                update_qp_params(ctx, quant_new, pic_type, layer, ctx.quant_min, ctx.quant_max);
            }
        }

        ctx.recode = RecodeState::Idle;
        if let Some(hrd) = hrd.as_mut() {
            hrd.update(bits, frame_param.encoded_order, is_intra);
        }

        Ok((Verdict::Ok, frame_status))
    }
}

/// A reference frame with pyramid layer 0, or any reference frame when the
/// GOP has no real B-frame spacing (`gopRefDist == 1`), is really a
/// low-delay B — the caller marks it `B | REF` but the controller treats it
/// as a `P` for QP-range and EMA purposes.
fn derive_picture_type(flags: FrameTypeFlags, layer: u32, gop_ref_dist: u32) -> PictureType {
    if flags.intersects(FrameTypeFlags::IDR | FrameTypeFlags::I) {
        PictureType::I
    } else if flags.intersects(FrameTypeFlags::P) {
        PictureType::P
    } else if flags.contains(FrameTypeFlags::REF) && (layer == 0 || gop_ref_dist == 1) {
        PictureType::P
    } else {
        PictureType::B
    }
}

/// Raw per-type field lookup, with no layer bias or clamp applied — used
/// only to read back the value `update_qp_params` just wrote for its own
/// type, where the bias is already baked into the stored field.
fn quant_field_for_type(ctx: &BrcContext, pic_type: PictureType) -> i32 {
    match pic_type {
        PictureType::I => ctx.quant_i,
        PictureType::P => ctx.quant_p,
        PictureType::B => ctx.quant_b,
    }
}

/// `currentQpForType(type, layer)`: the per-type prediction biased by
/// pyramid layer and clamped to the controller's currently active QP range.
/// `layerBias` is `0` for I, `layer` for P, `max(layer-1, 0)` for B.
fn current_qp_for_type(ctx: &BrcContext, pic_type: PictureType, layer: u32) -> i32 {
    let layer_bias = match pic_type {
        PictureType::I => 0,
        PictureType::P => layer as i32,
        PictureType::B => (layer as i32 - 1).max(0),
    };
    (quant_field_for_type(ctx, pic_type) + layer_bias).clamp(ctx.quant_min, ctx.quant_max)
}

/// Propagates a freshly-chosen QP to all three per-type fields, the way the
/// encoder derives `QuantI`/`QuantP`/`QuantB` from whichever type actually
/// got measured this frame. `min_quant`/`max_quant` clamp all three fields
/// uniformly — not per-type ranges, matching the source despite the type
/// names suggesting otherwise (see DESIGN.md).
fn update_qp_params(ctx: &mut BrcContext, qp: i32, pic_type: PictureType, layer: u32, min_quant: i32, max_quant: i32) {
    let clamp = |v: i32| v.clamp(min_quant, max_quant);

    match pic_type {
        PictureType::I => {
            ctx.quant_i = clamp(qp);
            ctx.quant_p = clamp(qp + 1);
            ctx.quant_b = clamp(qp + 2);
        }
        PictureType::P => {
            let q = qp - layer as i32;
            ctx.quant_i = clamp(q - 1);
            ctx.quant_p = clamp(q);
            ctx.quant_b = clamp(q + 1);
        }
        PictureType::B => {
            let q = qp - (layer as i32 - 1).max(0);
            ctx.quant_i = clamp(q - 2);
            ctx.quant_p = clamp(q - 1);
            ctx.quant_b = clamp(q);
        }
    }

    ctx.quant = quant_field_for_type(ctx, pic_type);
}

/// The core QP-update law: scales the current qstep by `(produced/target)^f_pow`
/// and converts back to QP. `limit` and `strict` are independent constraints
/// applied within whichever direction (overflow/underflow) is in play, not
/// mutually exclusive alternatives: `limit` keeps the step from landing past
/// the midpoint to the opposite bound, `strict` additionally forces at least
/// a one-QP move in the needed direction. A `qp` already sitting on the bound
/// being pushed against returns unchanged — the direction has no room left.
#[allow(clippy::too_many_arguments)]
fn new_qp_from_sizes(
    produced: f64,
    target: f64,
    min_qp: i32,
    max_qp: i32,
    qp: i32,
    quant_offset: i32,
    f_pow: f64,
    strict: bool,
    limit: bool,
) -> i32 {
    let qstep = qp_to_qstep(qp, quant_offset) * (produced / target).powf(f_pow);
    let mut qp_new = qstep_to_qp(qstep, quant_offset);

    if produced < target {
        if qp <= min_qp {
            return qp;
        }
        if limit {
            qp_new = qp_new.max((min_qp + qp + 1) >> 1);
        }
        if strict {
            qp_new = qp_new.min(qp - 1);
        }
    } else {
        if qp >= max_qp {
            return qp;
        }
        if limit {
            qp_new = qp_new.min((max_qp + qp + 1) >> 1);
        }
        if strict {
            qp_new = qp_new.max(qp + 1);
        }
    }

    qp_new.clamp(min_qp, max_qp)
}

/// Buffer-occupancy-driven QP adjustment: `bo` is the (already normalized,
/// clamped) running deviation from target buffer fullness, `dqp` the
/// EMA-derived reciprocal-QP estimate. A fresh scene change clamps the swing
/// to `qp +/- 5` outright; otherwise the new reciprocal-QP is rounded to a QP
/// and snapped onto one of two step ladders depending on `pyramid`, matching
/// `GetNewQPTotal`'s `mode = !pyramid` split: pyramid GOPs get the tighter
/// `[-2,+2]` ladder (their layer bias already does part of the adjusting),
/// non-pyramid GOPs get `[-3,+3]`.
#[allow(clippy::too_many_arguments)]
fn new_qp_from_deviation(
    bo: f64,
    dqp: f64,
    min_qp: i32,
    max_qp: i32,
    qp: i32,
    pyramid: bool,
    scene_change: bool,
) -> i32 {
    let bo = bo.clamp(-1.0, 1.0);
    let mut dqp = dqp.clamp(1.0 / max_qp as f64, 1.0 / min_qp as f64);
    dqp += (1.0 / max_qp as f64 - dqp) * bo;
    dqp = dqp.clamp(1.0 / max_qp as f64, 1.0 / min_qp as f64);
    let mut qp_new = (1.0 / dqp + 0.5) as i32;

    if scene_change {
        qp_new = qp_new.clamp(qp - 5, qp + 5);
    } else if pyramid {
        // qp_diff in [-2, +2].
        if qp_new >= qp + 5 {
            qp_new = qp + 2;
        } else if qp_new > qp + 3 {
            qp_new = qp + 1;
        } else if qp_new <= qp - 5 {
            qp_new = qp - 2;
        } else if qp_new < qp - 2 {
            qp_new = qp - 1;
        }
    } else {
        // qp_diff in [-3, +3].
        if qp_new >= qp + 5 {
            qp_new = qp + 3;
        } else if qp_new > qp + 3 {
            qp_new = qp + 2;
        } else if qp_new <= qp - 5 {
            qp_new = qp - 3;
        } else if qp_new < qp - 2 {
            qp_new = qp - 2;
        }
    }

    qp_new.clamp(min_qp, max_qp)
}

/// Relaxes `bAbPeriod` for the first few frames of a GOP, tapering linearly
/// from `1.5x` back down to `1.0x` over `N = min(gop_pic_size/2, 30)` frames,
/// then back *up* (as the reciprocal of the first-half ramp) over the second
/// half of the GOP, so `bAbPeriod` widens again heading into the next intra.
fn get_ab_period_coeff(num_in_gop: u64, gop_pic_size: u32) -> f64 {
    const MAX_FOR_CORRECTION: u32 = 30;
    const MAX_VALUE: f64 = 1.5;
    const MIN_VALUE: f64 = 1.0;

    if gop_pic_size < 2 || num_in_gop >= gop_pic_size as u64 {
        return 1.0;
    }

    let num_for_correction = (gop_pic_size / 2).min(MAX_FOR_CORRECTION);
    let k = |i: u32| MAX_VALUE - (MAX_VALUE - MIN_VALUE) * i as f64 / num_for_correction as f64;

    if num_in_gop < (gop_pic_size / 2) as u64 {
        let i = (num_in_gop as u32).min(num_for_correction - 1);
        k(i)
    } else {
        let n = gop_pic_size - 1 - num_in_gop as u32;
        1.0 / k(n.min(num_for_correction - 1))
    }
}

/// Whether `enc_order` falls close enough ahead of the next intra frame
/// that a panic-skip (rather than a further recode) is the right call.
fn is_frame_before_intra(enc_order: u64, last_i_enc_order: u64, gop_size: u32, gop_ref_dist: u32) -> bool {
    let since_last_i = enc_order.saturating_sub(last_i_enc_order) as i64;
    let threshold = ((gop_size as i64 * 3) / 4).max(gop_size as i64 - gop_ref_dist as i64 * 3);
    since_last_i > threshold
}

fn check_hrd_and_update_qp(hrd: &mut HrdModelImpl, bits: u64, enc_order: u64, is_key: bool, qp: i32) -> HrdCheck {
    if bits > hrd.max_frame_size_bits(enc_order, is_key) as u64 {
        hrd.set_underflow_quant(qp);
        HrdCheck::Big
    } else if bits < hrd.min_frame_size_bits(enc_order, is_key) as u64 {
        hrd.set_underflow_quant(qp);
        HrdCheck::Small
    } else {
        HrdCheck::Ok
    }
}

fn raw_frame_size_bits(width: u32, height: u32, chroma_format: ChromaFormat, bit_depth_luma: u8) -> f64 {
    let luma_size = width as u64 * height as u64;
    let frame_size = luma_size
        + match chroma_format {
            ChromaFormat::Yuv420 => luma_size / 2,
            ChromaFormat::Yuv422 => luma_size,
            ChromaFormat::Yuv444 => luma_size * 2,
        };
    (frame_size * bit_depth_luma as u64 / 8 * 8) as f64
}

/// Records a BIG/SMALL/panic verdict into the context, narrowing the QP
/// range for any further recode attempt on this frame. `requested` must be
/// one of the four recode variants of [`Verdict`]; `Verdict::Ok` is a
/// programming error at the call site.
fn set_recode_params(
    requested: Verdict,
    qp: i32,
    qp_new: i32,
    min_qp: i32,
    max_qp: i32,
    ctx: &mut BrcContext,
) -> BrcResult<Verdict> {
    ctx.recode = RecodeState::AwaitingRecode { enc_order: ctx.enc_order };

    match requested {
        Verdict::BigFrame | Verdict::PanicBigFrame => {
            if qp_new < qp {
                return Err(BrcError::UndefinedBehavior { expected: qp as u64, got: qp_new as u64 });
            }
            ctx.quant = qp_new;
            ctx.quant_max = max_qp;
            if requested == Verdict::BigFrame && qp_new > qp {
                ctx.quant_min = (qp + 1).max(min_qp);
                Ok(Verdict::BigFrame)
            } else {
                ctx.quant_min = min_qp;
                ctx.panic = true;
                Ok(Verdict::PanicBigFrame)
            }
        }
        Verdict::SmallFrame | Verdict::PanicSmallFrame => {
            if qp_new > qp {
                return Err(BrcError::UndefinedBehavior { expected: qp as u64, got: qp_new as u64 });
            }
            ctx.quant = qp_new;
            ctx.quant_min = min_qp;
            if requested == Verdict::SmallFrame && qp_new < qp {
                ctx.quant_max = (qp - 1).min(max_qp);
                Ok(Verdict::SmallFrame)
            } else {
                ctx.quant_max = max_qp;
                ctx.panic = true;
                Ok(Verdict::PanicSmallFrame)
            }
        }
        Verdict::Ok => unreachable!("set_recode_params called with a non-recode verdict"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;

    fn base_video_param() -> VideoParam {
        VideoParam {
            codec: CodecFamily::Avc,
            rate_control_method: RateControlMethod::Cbr,
            target_kbps: 2000,
            max_kbps: 2000,
            brc_param_multiplier: 0,
            initial_delay_kb: 1000,
            buffer_size_kb: 2000,
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

    fn frame(encoded_order: u64, frame_type: FrameTypeFlags, coded_bytes: u64, qp_y: i32) -> FrameParam {
        FrameParam {
            encoded_order,
            display_order: encoded_order,
            frame_type,
            pyramid_layer: 0,
            coded_frame_size_bytes: coded_bytes,
            num_recode: 0,
            qp_y,
        }
    }

    #[test]
    fn init_produces_a_usable_starting_qp() {
        let core = BrcCore::init(&base_video_param()).unwrap();
        let ctrl = core.get_frame_ctrl(&frame(0, FrameTypeFlags::IDR | FrameTypeFlags::I, 0, 0));
        assert!(ctrl.qp_y > 0 && ctrl.qp_y < 52);
    }

    #[test]
    fn steady_state_input_accepts_without_recode() {
        let mut core = BrcCore::init(&base_video_param()).unwrap();
        let ctrl = core.get_frame_ctrl(&frame(0, FrameTypeFlags::IDR | FrameTypeFlags::I, 0, 0));
        let target_bytes = (core.params.input_bits_per_frame / 8.0) as u64;

        let (verdict, _status) =
            core.update(&frame(0, FrameTypeFlags::IDR | FrameTypeFlags::I, target_bytes, ctrl.qp_y)).unwrap();
        assert_eq!(verdict, Verdict::Ok);
    }

    #[test_log::test]
    fn wildly_oversized_frame_triggers_a_recode() {
        let mut core = BrcCore::init(&base_video_param()).unwrap();
        let ctrl = core.get_frame_ctrl(&frame(0, FrameTypeFlags::IDR | FrameTypeFlags::I, 0, 0));
        let target_bytes = (core.params.input_bits_per_frame / 8.0) as u64;

        let (verdict, _status) = core
            .update(&frame(0, FrameTypeFlags::IDR | FrameTypeFlags::I, target_bytes * 50, ctrl.qp_y))
            .unwrap();
        assert!(verdict.is_recode());
    }

    #[test_log::test]
    fn protocol_guard_rejects_a_mismatched_recode_continuation() {
        let mut core = BrcCore::init(&base_video_param()).unwrap();
        let ctrl = core.get_frame_ctrl(&frame(0, FrameTypeFlags::IDR | FrameTypeFlags::I, 0, 0));
        let target_bytes = (core.params.input_bits_per_frame / 8.0) as u64;

        let (verdict, _) = core
            .update(&frame(0, FrameTypeFlags::IDR | FrameTypeFlags::I, target_bytes * 50, ctrl.qp_y))
            .unwrap();
        assert!(verdict.is_recode());

        let mut bogus = frame(1, FrameTypeFlags::P, target_bytes, ctrl.qp_y);
        bogus.num_recode = 1;
        assert!(core.update(&bogus).is_err());
    }

    #[test]
    fn reference_b_at_base_layer_is_treated_as_low_delay_p() {
        let flags = FrameTypeFlags::B | FrameTypeFlags::REF;
        assert_eq!(derive_picture_type(flags, 0, 4), PictureType::P);
        assert_eq!(derive_picture_type(flags, 2, 4), PictureType::B);
        assert_eq!(derive_picture_type(flags, 2, 1), PictureType::P);
    }

    #[test]
    fn ab_period_coeff_tapers_to_one() {
        assert_eq!(get_ab_period_coeff(0, 60), 1.5);
        assert_eq!(get_ab_period_coeff(100, 60), 1.0);

        // Past gopPicSize/2 the coefficient follows the falling-reciprocal
        // branch, easing back down from just under 1.0 toward 2/3 as the
        // next intra approaches.
        let just_past_mid = get_ab_period_coeff(30, 60);
        assert!((just_past_mid - 1.0 / 1.0166666666666666).abs() < 1e-9);

        let near_next_intra = get_ab_period_coeff(45, 60);
        assert!((near_next_intra - 1.0 / 1.2666666666666666).abs() < 1e-9);

        let last_frame_in_gop = get_ab_period_coeff(59, 60);
        assert!((last_frame_in_gop - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn update_qp_params_shifts_by_frame_type() {
        let mut ctx = BrcContext::new();
        update_qp_params(&mut ctx, 30, PictureType::I, 0, 1, 51);
        assert_eq!((ctx.quant_i, ctx.quant_p, ctx.quant_b), (30, 31, 32));
    }
}
