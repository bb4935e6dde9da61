// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

//! The two HRD (hypothetical reference decoder) timing models.
//!
//! Exposed as a small trait with exactly two implementors, dispatched
//! through an enum handle rather than a trait object — per the design
//! notes, there's no plugin requirement here, just two codec-specific
//! variants of the same virtual-buffer arithmetic.

mod h264;
mod hevc;

pub use h264::H264Hrd;
pub use hevc::HevcHrd;

use crate::params::BrcParams;

/// Scalar inputs shared by both HRD flavors, derived once from `BrcParams`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HrdInput {
    pub cbr: bool,
    pub bitrate: f64,
    pub max_cpb_removal_delay: f64,
    pub clock_tick: f64,
    pub cpb_size_90k: f64,
    pub init_cpb_removal_delay: f64,
}

impl HrdInput {
    pub fn new(params: &BrcParams) -> Self {
        use crate::types::RateControlMethod;

        let bitrate = params.max_bps as f64;
        HrdInput {
            cbr: params.rate_control_method == RateControlMethod::Cbr,
            bitrate,
            max_cpb_removal_delay: (1u64 << 24) as f64,
            clock_tick: 90_000.0 / params.frame_rate,
            cpb_size_90k: 90_000.0 * params.buffer_size_bytes as f64 * 8.0 / bitrate,
            init_cpb_removal_delay: 90_000.0 * 8.0 * params.initial_delay_bytes as f64 / bitrate,
        }
    }
}

/// Common contract implemented by [`H264Hrd`] and [`HevcHrd`].
pub trait HrdModel {
    fn reset(&mut self, params: &BrcParams);
    fn update(&mut self, size_in_bits: u64, enc_order: u64, is_key: bool);

    fn init_cpb_removal_delay(&self, enc_order: u64) -> u32;
    /// AVC-only (HEVC has no separate offset signal); default to `0`.
    fn init_cpb_removal_delay_offset(&self, enc_order: u64) -> u32 {
        let _ = enc_order;
        0
    }

    fn min_frame_size_bits(&self, enc_order: u64, is_key: bool) -> u32;
    fn max_frame_size_bits(&self, enc_order: u64, is_key: bool) -> u32;
    fn buffer_deviation(&self, enc_order: u64) -> f64;

    /// Per-recode guards: the HRD remembers the QP of the most recent
    /// violating attempt for the current frame, so further recode attempts
    /// within the frame don't widen back past it.
    fn set_underflow_quant(&mut self, qp: i32);
    fn reset_quant(&mut self);
    fn min_quant(&self) -> i32;
    fn max_quant(&self) -> i32;
}

/// `targetDelay`, shared by both flavors' `buffer_deviation`.
pub(crate) fn target_delay(cpb_size_90k: f64, init_cpb_removal_delay: f64, is_vbr: bool) -> f64 {
    if is_vbr {
        (0.75 * cpb_size_90k).min(init_cpb_removal_delay).max(0.5 * cpb_size_90k)
    } else {
        (0.5 * cpb_size_90k).min(init_cpb_removal_delay)
    }
}

/// Holds whichever HRD flavor is in effect, selected once at `init`.
pub enum HrdModelImpl {
    H264(H264Hrd),
    Hevc(HevcHrd),
}

impl HrdModelImpl {
    pub fn new(params: &BrcParams) -> Self {
        use crate::types::CodecFamily;
        match params.codec {
            CodecFamily::Avc => HrdModelImpl::H264(H264Hrd::new(params)),
            CodecFamily::Hevc => HrdModelImpl::Hevc(HevcHrd::new(params)),
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $method:ident $(, $arg:expr)*) => {
        match $self {
            HrdModelImpl::H264(h) => h.$method($($arg),*),
            HrdModelImpl::Hevc(h) => h.$method($($arg),*),
        }
    };
}

impl HrdModel for HrdModelImpl {
    fn reset(&mut self, params: &BrcParams) {
        dispatch!(self, reset, params)
    }

    fn update(&mut self, size_in_bits: u64, enc_order: u64, is_key: bool) {
        dispatch!(self, update, size_in_bits, enc_order, is_key)
    }

    fn init_cpb_removal_delay(&self, enc_order: u64) -> u32 {
        dispatch!(self, init_cpb_removal_delay, enc_order)
    }

    fn init_cpb_removal_delay_offset(&self, enc_order: u64) -> u32 {
        dispatch!(self, init_cpb_removal_delay_offset, enc_order)
    }

    fn min_frame_size_bits(&self, enc_order: u64, is_key: bool) -> u32 {
        dispatch!(self, min_frame_size_bits, enc_order, is_key)
    }

    fn max_frame_size_bits(&self, enc_order: u64, is_key: bool) -> u32 {
        dispatch!(self, max_frame_size_bits, enc_order, is_key)
    }

    fn buffer_deviation(&self, enc_order: u64) -> f64 {
        dispatch!(self, buffer_deviation, enc_order)
    }

    fn set_underflow_quant(&mut self, qp: i32) {
        dispatch!(self, set_underflow_quant, qp)
    }

    fn reset_quant(&mut self) {
        dispatch!(self, reset_quant)
    }

    fn min_quant(&self) -> i32 {
        dispatch!(self, min_quant)
    }

    fn max_quant(&self) -> i32 {
        dispatch!(self, max_quant)
    }
}
