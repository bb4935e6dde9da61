// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

//! TOML configuration for the `brc-sim` demo binary: a flat bag of encoder
//! parameters merged onto a 1080p30 CBR preset, the way `mm-server`'s
//! config loader merges a parsed file onto `mmserver.default.toml` (minus
//! the nested per-app registry, which this simulator has no use for).

use anyhow::{bail, Context, Result};
use std::path::Path;

use crate::types::{
    ChromaFormat, CodecFamily, CodingOption, CodingOption2, CodingOption3, EncoderResetOption,
    PictureStructure, RateControlMethod, VideoParam,
};

/// Serde representation of the configuration file; every field optional so
/// a partial file only overrides what it names.
mod parsed {
    use serde::Deserialize;

    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(deny_unknown_fields)]
    pub(super) struct Config {
        pub(super) codec: Option<String>,
        pub(super) rate_control: Option<String>,
        pub(super) target_kbps: Option<u32>,
        pub(super) max_kbps: Option<u32>,
        pub(super) width: Option<u32>,
        pub(super) height: Option<u32>,
        pub(super) frame_rate: Option<u32>,
        pub(super) gop_size: Option<u32>,
        pub(super) gop_ref_dist: Option<u32>,
        pub(super) b_pyramid: Option<bool>,
        pub(super) initial_delay_kb: Option<u32>,
        pub(super) buffer_size_kb: Option<u32>,
        pub(super) hrd_conformance: Option<String>,
        pub(super) max_frame_size_kb: Option<u32>,
        pub(super) win_brc_size: Option<u32>,
        pub(super) win_brc_max_avg_kbps: Option<u32>,
        pub(super) mbbrc_enabled: Option<bool>,
    }
}

/// Normalized simulator configuration, one level removed from the
/// controller's own [`VideoParam`] so the TOML surface can stay in plain
/// strings and kilobit units.
#[derive(Debug, Clone, PartialEq)]
pub struct SimConfig {
    pub codec: CodecFamily,
    pub rate_control_method: RateControlMethod,
    pub target_kbps: u32,
    pub max_kbps: u32,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub gop_size: u32,
    pub gop_ref_dist: u32,
    pub b_pyramid: bool,
    pub initial_delay_kb: u32,
    pub buffer_size_kb: u32,
    pub hrd_nal_conformance: bool,
    pub hrd_vui_nal_parameters: bool,
    pub max_frame_size_kb: u32,
    pub win_brc_size: u32,
    pub win_brc_max_avg_kbps: u32,
    pub mbbrc_enabled: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            codec: CodecFamily::Avc,
            rate_control_method: RateControlMethod::Cbr,
            target_kbps: 4000,
            max_kbps: 4000,
            width: 1920,
            height: 1080,
            frame_rate: 30,
            gop_size: 30,
            gop_ref_dist: 1,
            b_pyramid: false,
            initial_delay_kb: 2000,
            buffer_size_kb: 4000,
            hrd_nal_conformance: false,
            hrd_vui_nal_parameters: false,
            max_frame_size_kb: 0,
            win_brc_size: 0,
            win_brc_max_avg_kbps: 0,
            mbbrc_enabled: false,
        }
    }
}

impl SimConfig {
    /// Loads and merges a config file onto the default preset; `None`
    /// returns the preset unchanged.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(SimConfig::default());
        };

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let parsed: parsed::Config = toml::from_str(&content)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        SimConfig::default().merge(parsed)
    }

    fn merge(mut self, p: parsed::Config) -> Result<Self> {
        if let Some(v) = p.codec {
            self.codec = match v.as_str() {
                "avc" | "h264" => CodecFamily::Avc,
                "hevc" | "h265" => CodecFamily::Hevc,
                other => bail!("unknown codec {other:?}, expected \"avc\" or \"hevc\""),
            };
        }
        if let Some(v) = p.rate_control {
            self.rate_control_method = match v.as_str() {
                "cbr" => RateControlMethod::Cbr,
                "vbr" => RateControlMethod::Vbr,
                other => bail!("unknown rate_control {other:?}, expected \"cbr\" or \"vbr\""),
            };
        }
        if let Some(v) = p.hrd_conformance {
            (self.hrd_nal_conformance, self.hrd_vui_nal_parameters) = match v.as_str() {
                "none" => (false, false),
                "weak" => (true, false),
                "strong" => (true, true),
                other => bail!("unknown hrd_conformance {other:?}, expected \"none\", \"weak\", or \"strong\""),
            };
        }

        if let Some(v) = p.target_kbps {
            self.target_kbps = v;
        }
        if let Some(v) = p.max_kbps {
            self.max_kbps = v;
        }
        if let Some(v) = p.width {
            self.width = v;
        }
        if let Some(v) = p.height {
            self.height = v;
        }
        if let Some(v) = p.frame_rate {
            self.frame_rate = v;
        }
        if let Some(v) = p.gop_size {
            self.gop_size = v;
        }
        if let Some(v) = p.gop_ref_dist {
            self.gop_ref_dist = v;
        }
        if let Some(v) = p.b_pyramid {
            self.b_pyramid = v;
        }
        if let Some(v) = p.initial_delay_kb {
            self.initial_delay_kb = v;
        }
        if let Some(v) = p.buffer_size_kb {
            self.buffer_size_kb = v;
        }
        if let Some(v) = p.max_frame_size_kb {
            self.max_frame_size_kb = v;
        }
        if let Some(v) = p.win_brc_size {
            self.win_brc_size = v;
        }
        if let Some(v) = p.win_brc_max_avg_kbps {
            self.win_brc_max_avg_kbps = v;
        }
        if let Some(v) = p.mbbrc_enabled {
            self.mbbrc_enabled = v;
        }

        if self.width == 0 || self.height == 0 {
            bail!("width and height must be nonzero");
        }

        Ok(self)
    }

    pub fn to_video_param(&self) -> VideoParam {
        VideoParam {
            codec: self.codec,
            rate_control_method: self.rate_control_method,
            target_kbps: self.target_kbps,
            max_kbps: self.max_kbps,
            brc_param_multiplier: 0,
            initial_delay_kb: self.initial_delay_kb,
            buffer_size_kb: self.buffer_size_kb,
            width: self.width,
            height: self.height,
            frame_rate_num: self.frame_rate,
            frame_rate_den: 1,
            chroma_format: ChromaFormat::Yuv420,
            bit_depth_luma: 8,
            gop_size: self.gop_size,
            gop_ref_dist: self.gop_ref_dist,
            picture_structure: PictureStructure::Progressive,
            async_depth: 1,
            coding_option: CodingOption {
                nal_hrd_conformance: self.hrd_nal_conformance,
                vui_nal_hrd_parameters: self.hrd_vui_nal_parameters,
            },
            coding_option2: CodingOption2 {
                max_frame_size_bytes: self.max_frame_size_kb * 1000,
                b_pyramid: self.b_pyramid,
                qp_bounds: None,
            },
            coding_option3: CodingOption3 {
                win_brc_size: self.win_brc_size,
                win_brc_max_avg_kbps: self.win_brc_max_avg_kbps,
                mbbrc_enabled: self.mbbrc_enabled,
            },
            encoder_reset_option: EncoderResetOption::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_produce_a_valid_video_param() {
        let cfg = SimConfig::default();
        let vp = cfg.to_video_param();
        assert_eq!(vp.width, 1920);
        assert_eq!(vp.codec, CodecFamily::Avc);
    }

    #[test]
    fn merge_overrides_only_named_fields() {
        let parsed: parsed::Config = toml::from_str("target_kbps = 8000\ncodec = \"hevc\"\n").unwrap();
        let cfg = SimConfig::default().merge(parsed).unwrap();
        assert_eq!(cfg.target_kbps, 8000);
        assert_eq!(cfg.codec, CodecFamily::Hevc);
        assert_eq!(cfg.max_kbps, SimConfig::default().max_kbps);
    }

    #[test]
    fn unknown_codec_is_rejected() {
        let parsed: parsed::Config = toml::from_str("codec = \"mpeg2\"\n").unwrap();
        assert!(SimConfig::default().merge(parsed).is_err());
    }

    #[test]
    fn zero_dimensions_are_rejected() {
        let parsed: parsed::Config = toml::from_str("width = 0\n").unwrap();
        assert!(SimConfig::default().merge(parsed).is_err());
    }
}
