// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info};

use brc::config::SimConfig;
use brc::core::BrcCore;
use brc::types::{FrameParam, FrameTypeFlags};

/// Drives the bitrate controller over a synthetic frame trace and reports
/// the QP and verdict history, the way a conformance test harness would
/// exercise an encoder's rate control without an actual codec attached.
#[derive(Debug, Parser)]
#[command(name = "brc-sim")]
#[command(about = "Simulate a per-frame bitrate controller session", long_about = None)]
struct Cli {
    /// Path to a TOML config file. Unset fields fall back to a 1080p30 CBR preset.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Number of frames to simulate.
    #[arg(short, long, default_value = "300")]
    frames: u64,
    /// Fraction (0.0-1.0) of frames that overshoot their target size by 8x,
    /// modeling scene cuts.
    #[arg(long, default_value = "0.0")]
    scene_cut_rate: f64,
}

fn init_logging() -> Result<()> {
    if let Ok(env_filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    } else {
        let filter = tracing_subscriber::EnvFilter::builder()
            .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
            .from_env()?
            .add_directive("brc_sim=info".parse()?)
            .add_directive("brc=info".parse()?);
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    Ok(())
}

/// A deterministic stand-in for an encoder: the "coded size" of a frame is
/// just its target size perturbed by a fixed pattern, optionally spiked to
/// simulate a scene cut. Good enough to exercise recode/panic paths without
/// linking an actual codec.
fn simulate_coded_bytes(target_bytes: u64, frame_index: u64, is_scene_cut: bool) -> u64 {
    if is_scene_cut {
        return target_bytes * 8;
    }

    let wobble = ((frame_index % 7) as i64 - 3) * (target_bytes as i64 / 20);
    (target_bytes as i64 + wobble).max(1) as u64
}

fn main() -> Result<()> {
    init_logging()?;

    let cli = Cli::parse();
    let config = SimConfig::load(cli.config.as_deref()).context("loading config")?;
    let video_param = config.to_video_param();

    let mut core = BrcCore::init(&video_param).context("initializing brc core")?;
    info!(?config, "starting simulation");

    let mut recodes = 0u64;
    let mut panics = 0u64;

    for i in 0..cli.frames {
        let frame_type = if i == 0 || i % video_param.gop_size as u64 == 0 {
            FrameTypeFlags::IDR | FrameTypeFlags::I
        } else {
            FrameTypeFlags::P | FrameTypeFlags::REF
        };

        let mut frame_param = FrameParam {
            encoded_order: i,
            display_order: i,
            frame_type,
            pyramid_layer: 0,
            coded_frame_size_bytes: 0,
            num_recode: 0,
            qp_y: 0,
        };

        let is_scene_cut = cli.scene_cut_rate > 0.0
            && i > 0
            && (i as f64 * cli.scene_cut_rate).fract() < cli.scene_cut_rate;

        loop {
            let ctrl = core.get_frame_ctrl(&frame_param);
            frame_param.qp_y = ctrl.qp_y;

            let target_bytes = (video_param.target_kbps as u64 * 1000 / 8) / video_param.frame_rate_num as u64;
            frame_param.coded_frame_size_bytes =
                simulate_coded_bytes(target_bytes.max(1), i, is_scene_cut && frame_param.num_recode == 0);

            let (verdict, status) = core.update(&frame_param)?;
            debug!(frame = i, qp = ctrl.qp_y, bytes = frame_param.coded_frame_size_bytes, ?verdict, ?status);

            if !verdict.is_recode() {
                break;
            }

            recodes += 1;
            if verdict.is_panic() {
                panics += 1;
                break;
            }
            frame_param.num_recode += 1;
        }
    }

    info!(frames = cli.frames, recodes, panics, "simulation complete");
    Ok(())
}
