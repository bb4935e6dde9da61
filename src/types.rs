// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

//! Shared enums and the external input/output structs crossing the
//! controller's boundary (§6 of the design notes).

/// The codec family the controller is tuned for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecFamily {
    Avc,
    Hevc,
}

/// Rate control method requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateControlMethod {
    Cbr,
    Vbr,
}

/// Chroma subsampling format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChromaFormat {
    Yuv420,
    Yuv422,
    Yuv444,
}

/// How thoroughly the controller should conform to the HRD (hypothetical
/// reference decoder) buffer model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HrdConformance {
    None,
    Weak,
    Strong,
}

impl HrdConformance {
    pub fn is_enabled(self) -> bool {
        !matches!(self, HrdConformance::None)
    }
}

/// Picture structure, used only to decide field mode (HEVC + non-progressive).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PictureStructure {
    Progressive,
    TopField,
    BottomField,
    FieldPair,
}

/// Derived per-frame picture type (distinct from the caller's `FrameTypeFlags`,
/// which may mark a low-delay B as a reference P).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PictureType {
    I,
    P,
    B,
}

bitflags::bitflags! {
    /// Caller-supplied frame type flags, mirroring the bitfield the encoder
    /// reports per frame (IDR/I/P/B/REF can combine, e.g. a reference B).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameTypeFlags: u8 {
        const IDR = 0b0000_0001;
        const I   = 0b0000_0010;
        const P   = 0b0000_0100;
        const B   = 0b0000_1000;
        const REF = 0b0001_0000;
    }
}

/// Extension bag: `CodingOption` (NAL-HRD / VUI-NAL-HRD toggles).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CodingOption {
    pub nal_hrd_conformance: bool,
    pub vui_nal_hrd_parameters: bool,
}

/// Extension bag: `CodingOption2` (max frame size, per-type QP bounds, pyramid B).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CodingOption2 {
    pub max_frame_size_bytes: u32,
    pub b_pyramid: bool,
    pub qp_bounds: Option<QpBounds>,
}

/// A validated `(min, max)` QP triple per frame type, as supplied by the
/// caller before `quant_offset` is folded into the max values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpBounds {
    pub min_qp_i: i32,
    pub max_qp_i: i32,
    pub min_qp_p: i32,
    pub max_qp_p: i32,
    pub min_qp_b: i32,
    pub max_qp_b: i32,
}

impl QpBounds {
    pub(crate) fn is_valid(&self) -> bool {
        let ok = |min: i32, max: i32| min >= 1 && max <= 51 && max > min;
        ok(self.min_qp_i, self.max_qp_i)
            && ok(self.min_qp_p, self.max_qp_p)
            && ok(self.min_qp_b, self.max_qp_b)
    }
}

/// Extension bag: `CodingOption3` (sliding-window bitrate cap, MBBRC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CodingOption3 {
    pub win_brc_size: u32,
    pub win_brc_max_avg_kbps: u32,
    pub mbbrc_enabled: bool,
}

/// Extension bag: `EncoderResetOption` (force a fresh sequence on reset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EncoderResetOption {
    pub start_new_sequence: bool,
}

/// The full input bag consumed by `init`/`reset`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoParam {
    pub codec: CodecFamily,
    pub rate_control_method: RateControlMethod,
    pub target_kbps: u32,
    pub max_kbps: u32,
    /// Multiplies `target_kbps`/`max_kbps`; `0` is treated as `1`.
    pub brc_param_multiplier: u32,
    pub initial_delay_kb: u32,
    pub buffer_size_kb: u32,
    pub width: u32,
    pub height: u32,
    pub frame_rate_num: u32,
    pub frame_rate_den: u32,
    pub chroma_format: ChromaFormat,
    pub bit_depth_luma: u8,
    pub gop_size: u32,
    pub gop_ref_dist: u32,
    pub picture_structure: PictureStructure,
    pub async_depth: u32,
    pub coding_option: CodingOption,
    pub coding_option2: CodingOption2,
    pub coding_option3: CodingOption3,
    pub encoder_reset_option: EncoderResetOption,
}

/// Per-frame input to [`crate::core::BrcCore::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameParam {
    pub encoded_order: u64,
    pub display_order: u64,
    pub frame_type: FrameTypeFlags,
    pub pyramid_layer: u32,
    pub coded_frame_size_bytes: u64,
    pub num_recode: u32,
    /// The `QpY` previously emitted by `get_frame_ctrl` for this frame.
    pub qp_y: i32,
}

/// Per-frame output from [`crate::core::BrcCore::get_frame_ctrl`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameCtrl {
    pub qp_y: i32,
    pub initial_cpb_removal_delay: Option<u32>,
    pub initial_cpb_removal_offset: Option<u32>,
    /// One byte per 16x16 block, raster order, present iff MBBRC is enabled.
    pub mbqp_map: Option<Vec<u8>>,
}

/// Status fields filled in by `update`, alongside the returned [`crate::error::Verdict`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameStatus {
    pub min_frame_size_bits: u32,
}
