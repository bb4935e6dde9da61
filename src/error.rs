// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

//! Error and status types returned across the controller's boundary.

/// Failures the controller can report back to its caller.
///
/// These map to the status codes in the original interface
/// (`not_initialized`, `undefined_behavior`, `incompatible_video_param`,
/// `not_enough_buffer`, `invalid_video_param`); `null_pointer` has no
/// counterpart in a safe Rust API and is omitted.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrcError {
    #[error("controller already initialized")]
    AlreadyInitialized,

    #[error("controller not initialized")]
    NotInitialized,

    #[error("invalid video param: {0}")]
    InvalidVideoParam(String),

    #[error("incompatible video param: {0} cannot change without a new sequence")]
    IncompatibleVideoParam(String),

    #[error("undefined behavior: expected {expected}, got {got}")]
    UndefinedBehavior { expected: u64, got: u64 },

    #[error("not enough buffer: HRD violation while already in panic mode")]
    NotEnoughBuffer,
}

pub type BrcResult<T> = Result<T, BrcError>;

/// The recode verdict carried in [`crate::core::FrameStatus`].
///
/// Unlike [`BrcError`], this is not a failure: it is the control signal the
/// caller branches on after an `update()` call, the way
/// `rate_control::RateControlMode` is a plain enum the caller matches on
/// rather than an error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Ok,
    BigFrame,
    SmallFrame,
    PanicBigFrame,
    PanicSmallFrame,
}

impl Verdict {
    pub fn is_panic(self) -> bool {
        matches!(self, Verdict::PanicBigFrame | Verdict::PanicSmallFrame)
    }

    pub fn is_recode(self) -> bool {
        matches!(
            self,
            Verdict::BigFrame | Verdict::SmallFrame | Verdict::PanicBigFrame | Verdict::PanicSmallFrame
        )
    }
}

/// Internal three-way result of an HRD min/max frame size check, distinct
/// from [`Verdict`] because it hasn't been through [`crate::core::set_recode_params`]
/// yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HrdCheck {
    Ok,
    Big,
    Small,
}
