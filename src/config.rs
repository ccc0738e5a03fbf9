//! Session configuration
//!
//! Every knob has a sensible default. [`SessionConfig::from_env`] lets a few of them be
//! overridden through `HWC_*` environment variables, mostly for debugging.

use std::{path::PathBuf, time::Duration};

use tracing::{info, warn};

use crate::{capture::dump::DisplayKind, utils::DisplayId};

/// Configuration of one [`CompositionSession`](crate::session::CompositionSession)
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Identity of the display, as seen by the client
    pub display_id: DisplayId,
    /// Kind of the display
    pub display_kind: DisplayKind,
    /// Treat HDR content as SDR
    pub disable_hdr: bool,
    /// Ignore per-layer brightness of device composed layers
    pub disable_sdr_dimming: bool,
    /// The client does not wait on release fences, so none are handed out
    pub zero_swap_interval: bool,
    /// Vsyncs the display needs to apply a new refresh rate
    pub vsyncs_to_apply_rate_change: u32,
    /// Upper bound of blocking waits for capture completion
    pub capture_wait: Duration,
    /// Base directory of frame dumps
    pub dump_dir: PathBuf,
    /// Let the display pipe tone map HDR content instead of the client
    pub allow_sde_tonemap: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            display_id: DisplayId(0),
            display_kind: DisplayKind::Builtin,
            disable_hdr: false,
            disable_sdr_dimming: false,
            zero_swap_interval: false,
            vsyncs_to_apply_rate_change: 1,
            capture_wait: Duration::from_millis(1000),
            dump_dir: PathBuf::from("/data/vendor/display"),
            allow_sde_tonemap: false,
        }
    }
}

fn parse_flag(value: &str) -> bool {
    let value = value.to_lowercase();
    value == "1" || value == "true" || value == "yes" || value == "y"
}

impl SessionConfig {
    /// Default configuration for `display`
    pub fn new(display_id: DisplayId, display_kind: DisplayKind) -> Self {
        SessionConfig {
            display_id,
            display_kind,
            ..Default::default()
        }
    }

    /// Applies the `HWC_*` overrides of the process environment
    pub fn from_env(self) -> Self {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Applies overrides looked up through `var`
    pub fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(value) = var("HWC_DISABLE_HDR") {
            self.disable_hdr = parse_flag(&value);
        }
        if let Some(value) = var("HWC_DISABLE_SDR_DIMMING") {
            self.disable_sdr_dimming = parse_flag(&value);
        }
        if let Some(value) = var("HWC_ZERO_SWAP_INTERVAL") {
            self.zero_swap_interval = parse_flag(&value);
        }
        if let Some(value) = var("HWC_ALLOW_TONEMAP") {
            self.allow_sde_tonemap = parse_flag(&value);
        }
        if let Some(value) = var("HWC_VSYNCS_TO_APPLY_RATE_CHANGE") {
            match value.parse::<u32>() {
                Ok(vsyncs) => self.vsyncs_to_apply_rate_change = vsyncs,
                Err(err) => warn!(value, ?err, "Ignoring HWC_VSYNCS_TO_APPLY_RATE_CHANGE"),
            }
        }
        if let Some(value) = var("HWC_CAPTURE_WAIT_MS") {
            match value.parse::<u64>() {
                Ok(ms) if ms > 0 => self.capture_wait = Duration::from_millis(ms),
                _ => warn!(value, "Ignoring HWC_CAPTURE_WAIT_MS"),
            }
        }
        if let Some(value) = var("HWC_DUMP_DIR") {
            if value.is_empty() {
                warn!("Ignoring empty HWC_DUMP_DIR");
            } else {
                info!(dir = value.as_str(), "Frame dumps redirected");
                self.dump_dir = PathBuf::from(value);
            }
        }
        self
    }
}
