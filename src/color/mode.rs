//! Colour mode bookkeeping
//!
//! The engine exposes its colour profiles as opaque names plus a list of
//! `(attribute, value)` pairs. [`ColorModeManager`] sorts these into a table of
//! `mode -> render intent -> dynamic range -> profile name` once and then picks the
//! profile to program for every frame.
use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use super::{ColorError, ColorMatrix, Dataspace};
use crate::engine::EngineError;

const NATIVE_IDENTITY_PROFILE: &str = "hal_native_identity";
const NATIVE_PROFILE_PREFIX: &str = "hal_native";

const ATTR_COLOR_GAMUT: &str = "ColorGamut";
const ATTR_DYNAMIC_RANGE: &str = "DynamicRange";
const ATTR_PICTURE_QUALITY: &str = "PictureQuality";
const ATTR_GAMMA_TRANSFER: &str = "GammaTransfer";
const ATTR_RENDER_INTENT: &str = "RenderIntent";

const GAMUT_NATIVE: &str = "native";
const GAMUT_SRGB: &str = "srgb";
const GAMUT_DCIP3: &str = "dcip3";
const GAMUT_BT2020: &str = "bt2020";
const RANGE_SDR: &str = "sdr";
const RANGE_HDR: &str = "hdr";
const QUALITY_STANDARD: &str = "standard";
const TRANSFER_ST2084: &str = "st2084";
const TRANSFER_HLG: &str = "hlg";
const TRANSFER_SRGB: &str = "srgb";

/// Perceptual colour modes a client can ask for
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ColorMode {
    #[default]
    Native = 0,
    StandardBt601_625 = 1,
    StandardBt601_625Unadjusted = 2,
    StandardBt601_525 = 3,
    StandardBt601_525Unadjusted = 4,
    StandardBt709 = 5,
    DciP3 = 6,
    Srgb = 7,
    AdobeRgb = 8,
    DisplayP3 = 9,
    Bt2020 = 10,
    Bt2100Pq = 11,
    Bt2100Hlg = 12,
    DisplayBt2020 = 13,
}

impl TryFrom<i32> for ColorMode {
    type Error = ColorError;

    fn try_from(raw: i32) -> Result<Self, Self::Error> {
        Ok(match raw {
            0 => ColorMode::Native,
            1 => ColorMode::StandardBt601_625,
            2 => ColorMode::StandardBt601_625Unadjusted,
            3 => ColorMode::StandardBt601_525,
            4 => ColorMode::StandardBt601_525Unadjusted,
            5 => ColorMode::StandardBt709,
            6 => ColorMode::DciP3,
            7 => ColorMode::Srgb,
            8 => ColorMode::AdobeRgb,
            9 => ColorMode::DisplayP3,
            10 => ColorMode::Bt2020,
            11 => ColorMode::Bt2100Pq,
            12 => ColorMode::Bt2100Hlg,
            13 => ColorMode::DisplayBt2020,
            _ => return Err(ColorError::InvalidMode(raw)),
        })
    }
}

impl ColorMode {
    /// Dataspace the client target should be rendered in for this mode
    pub fn client_target_dataspace(&self) -> Dataspace {
        match self {
            ColorMode::DisplayP3 | ColorMode::DciP3 => Dataspace::DISPLAY_P3,
            ColorMode::Bt2100Pq => Dataspace::BT2020_PQ,
            ColorMode::Bt2100Hlg => Dataspace::BT2020_HLG,
            ColorMode::DisplayBt2020 | ColorMode::Bt2020 => Dataspace::DISPLAY_BT2020,
            _ => Dataspace::V0_SRGB,
        }
    }
}

/// How out-of-gamut colours are mapped
///
/// Values above [`RenderIntent::TONE_MAP_ENHANCE`] are vendor extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RenderIntent(pub u32);

impl RenderIntent {
    /// Preserve colours inside the gamut, clip the rest
    pub const COLORIMETRIC: RenderIntent = RenderIntent(0);
    /// Enhance colours
    pub const ENHANCE: RenderIntent = RenderIntent(1);
    /// Tone map HDR content, colorimetric otherwise
    pub const TONE_MAP_COLORIMETRIC: RenderIntent = RenderIntent(2);
    /// Tone map HDR content, enhance otherwise
    pub const TONE_MAP_ENHANCE: RenderIntent = RenderIntent(3);
    /// Highest vendor extended intent
    pub const MAX_EXTENDED: RenderIntent = RenderIntent(0x1ff);
}

/// Dynamic range a profile is tuned for
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum DynamicRange {
    #[default]
    Sdr,
    Hdr,
}

/// Access to the engine's colour profiles
pub trait ColorProfileSource {
    /// Names of every profile the display supports
    fn color_profiles(&self) -> Result<Vec<String>, EngineError>;
    /// `(attribute, value)` pairs describing a profile
    fn color_profile_attributes(&self, name: &str) -> Result<Vec<(String, String)>, EngineError>;
    /// Whether the pipes can tone map HDR content on their own
    fn supports_pipe_tonemap(&self) -> bool;
    /// Program a profile
    fn set_color_profile(&mut self, name: &str) -> Result<(), EngineError>;
    /// Program the display-wide colour transform
    fn set_color_transform(&mut self, matrix: &ColorMatrix) -> Result<(), EngineError>;
}

#[derive(Debug, Default, Clone)]
struct ProfileSlots {
    sdr: Option<String>,
    hdr: Option<String>,
}

impl ProfileSlots {
    fn get(&self, range: DynamicRange) -> Option<&str> {
        match range {
            DynamicRange::Sdr => self.sdr.as_deref(),
            DynamicRange::Hdr => self.hdr.as_deref(),
        }
    }

    fn set(&mut self, range: DynamicRange, name: &str) {
        let slot = match range {
            DynamicRange::Sdr => &mut self.sdr,
            DynamicRange::Hdr => &mut self.hdr,
        };
        *slot = Some(name.to_owned());
    }
}

#[derive(Debug, Default)]
struct ProfileAttributes {
    gamut: Option<String>,
    range: Option<String>,
    quality: Option<String>,
    transfer: Option<String>,
    intent: Option<String>,
}

impl ProfileAttributes {
    fn parse(attrs: &[(String, String)]) -> Self {
        let mut parsed = ProfileAttributes::default();
        for (key, value) in attrs {
            let slot = if key.contains(ATTR_COLOR_GAMUT) {
                &mut parsed.gamut
            } else if key.contains(ATTR_DYNAMIC_RANGE) {
                &mut parsed.range
            } else if key.contains(ATTR_PICTURE_QUALITY) {
                &mut parsed.quality
            } else if key.contains(ATTR_GAMMA_TRANSFER) {
                &mut parsed.transfer
            } else if key.contains(ATTR_RENDER_INTENT) {
                &mut parsed.intent
            } else {
                continue;
            };
            *slot = Some(value.clone());
        }
        parsed
    }
}

/// The colour mode table of one display plus the currently selected mode
#[derive(Debug)]
pub struct ColorModeManager {
    table: BTreeMap<ColorMode, BTreeMap<RenderIntent, ProfileSlots>>,
    preferred: BTreeMap<(ColorMode, DynamicRange), String>,
    current_mode: ColorMode,
    current_intent: RenderIntent,
    current_range: DynamicRange,
    apply_pending: bool,
    color_matrix: ColorMatrix,
}

impl Default for ColorModeManager {
    fn default() -> Self {
        ColorModeManager {
            table: BTreeMap::new(),
            preferred: BTreeMap::new(),
            current_mode: ColorMode::Native,
            current_intent: RenderIntent::COLORIMETRIC,
            current_range: DynamicRange::Sdr,
            apply_pending: false,
            color_matrix: super::IDENTITY_MATRIX,
        }
    }
}

impl ColorModeManager {
    /// Builds the table from the profiles `engine` exposes
    pub fn populate<E: ColorProfileSource + ?Sized>(engine: &E) -> Self {
        Self::populate_with_tonemap(engine, false)
    }

    /// Like [`populate`](Self::populate), but treats HDR profiles as pipe tone mapped
    /// when `allow_pipe_tonemap` is set, even if the engine does not claim support
    pub fn populate_with_tonemap<E: ColorProfileSource + ?Sized>(engine: &E, allow_pipe_tonemap: bool) -> Self {
        let mut manager = ColorModeManager::default();
        let pipe_tonemap = allow_pipe_tonemap || engine.supports_pipe_tonemap();

        let profiles = match engine.color_profiles() {
            Ok(profiles) if !profiles.is_empty() => profiles,
            result => {
                warn!(?result, "No colour profiles reported, using native mode");
                manager.insert(
                    ColorMode::Native,
                    RenderIntent::COLORIMETRIC,
                    DynamicRange::Sdr,
                    NATIVE_IDENTITY_PROFILE,
                );
                return manager;
            }
        };

        for name in &profiles {
            let attrs = match engine.color_profile_attributes(name) {
                Ok(attrs) => attrs,
                Err(err) => {
                    warn!(profile = name.as_str(), ?err, "Failed to query profile attributes");
                    Vec::new()
                }
            };
            if attrs.is_empty() {
                if name.contains(NATIVE_PROFILE_PREFIX) {
                    manager.insert(
                        ColorMode::Native,
                        RenderIntent::COLORIMETRIC,
                        DynamicRange::Sdr,
                        name,
                    );
                }
                continue;
            }
            manager.classify(name, ProfileAttributes::parse(&attrs), pipe_tonemap);
        }

        debug!(modes = manager.table.len(), "Populated colour modes");
        manager
    }

    fn classify(&mut self, name: &str, attrs: ProfileAttributes, pipe_tonemap: bool) {
        let gamut = attrs.gamut.as_deref().unwrap_or(GAMUT_NATIVE);
        let range = attrs.range.as_deref().unwrap_or(RANGE_SDR);
        let quality = attrs.quality.as_deref().unwrap_or(QUALITY_STANDARD);
        let transfer = attrs.transfer.as_deref().unwrap_or_default();

        let intent = match attrs.intent.as_deref().map(str::parse::<u32>) {
            Some(Ok(intent)) if RenderIntent(intent) <= RenderIntent::MAX_EXTENDED => RenderIntent(intent),
            other => {
                warn!(profile = name, intent = ?other, "Invalid render intent, skipping profile");
                return;
            }
        };

        use DynamicRange::*;
        if gamut == GAMUT_NATIVE {
            self.insert(ColorMode::Native, intent, Sdr, name);
        }
        match (gamut, range) {
            (GAMUT_SRGB, RANGE_SDR) => self.insert(ColorMode::Srgb, intent, Sdr, name),
            (GAMUT_DCIP3, RANGE_SDR) => self.insert(ColorMode::DisplayP3, intent, Sdr, name),
            (GAMUT_DCIP3, RANGE_HDR) => {
                if pipe_tonemap {
                    self.insert(ColorMode::DisplayP3, intent, Hdr, name);
                } else if quality == QUALITY_STANDARD {
                    self.insert(ColorMode::Bt2100Pq, intent, Hdr, name);
                    self.insert(ColorMode::Bt2100Hlg, intent, Hdr, name);
                }
            }
            (GAMUT_BT2020, _) => match transfer {
                TRANSFER_ST2084 => self.insert(ColorMode::Bt2100Pq, RenderIntent::COLORIMETRIC, Hdr, name),
                TRANSFER_HLG => self.insert(ColorMode::Bt2100Hlg, RenderIntent::COLORIMETRIC, Hdr, name),
                TRANSFER_SRGB => {
                    self.insert(ColorMode::DisplayBt2020, RenderIntent::COLORIMETRIC, Sdr, name)
                }
                _ => {}
            },
            _ => {}
        }
    }

    fn insert(&mut self, mode: ColorMode, intent: RenderIntent, range: DynamicRange, name: &str) {
        self.table
            .entry(mode)
            .or_default()
            .entry(intent)
            .or_default()
            .set(range, name);
    }

    fn lookup(&self, mode: ColorMode, intent: RenderIntent, range: DynamicRange) -> Option<&str> {
        self.table.get(&mode)?.get(&intent)?.get(range)
    }

    /// Number of supported modes, at least one
    pub fn mode_count(&self) -> usize {
        self.table.len().max(1)
    }

    /// Supported modes, in ascending order
    pub fn modes(&self) -> impl Iterator<Item = ColorMode> + '_ {
        self.table.keys().copied()
    }

    /// Render intents supported in `mode`
    pub fn render_intents(&self, mode: ColorMode) -> Result<Vec<RenderIntent>, ColorError> {
        self.table
            .get(&mode)
            .map(|intents| intents.keys().copied().collect())
            .ok_or(ColorError::ModeUnsupported(mode))
    }

    /// Checks that the table has an entry for `mode` and `intent`
    pub fn validate(&self, mode: ColorMode, intent: RenderIntent) -> Result<(), ColorError> {
        let intents = self.table.get(&mode).ok_or(ColorError::ModeUnsupported(mode))?;
        if !intents.contains_key(&intent) {
            return Err(ColorError::IntentUnsupported { mode, intent });
        }
        Ok(())
    }

    /// Currently selected mode and intent
    pub fn current(&self) -> (ColorMode, RenderIntent) {
        (self.current_mode, self.current_intent)
    }

    /// Dynamic range of the last applied profile
    pub fn current_range(&self) -> DynamicRange {
        self.current_range
    }

    /// The last colour transform set by the client
    pub fn color_transform(&self) -> &ColorMatrix {
        &self.color_matrix
    }

    /// Applies the SDR profile of `mode`/`intent` right away
    pub fn set_color_mode_with_render_intent<E: ColorProfileSource + ?Sized>(
        &mut self,
        engine: &mut E,
        mode: ColorMode,
        intent: RenderIntent,
    ) -> Result<(), ColorError> {
        self.validate(mode, intent)?;
        if self.current() == (mode, intent) {
            return Ok(());
        }

        let name = self
            .lookup(mode, intent, DynamicRange::Sdr)
            .ok_or(ColorError::IntentUnsupported { mode, intent })?
            .to_owned();
        engine.set_color_profile(&name).map_err(ColorError::Engine)?;
        self.restore_color_transform(engine)?;

        self.current_mode = mode;
        self.current_intent = intent;
        debug!(?mode, ?intent, profile = name.as_str(), "Applied colour mode");
        Ok(())
    }

    /// Records `mode`/`intent` to be applied on the next frame
    pub fn cache_color_mode_with_render_intent(
        &mut self,
        mode: ColorMode,
        intent: RenderIntent,
    ) -> Result<(), ColorError> {
        self.validate(mode, intent)?;
        if self.current() == (mode, intent) {
            return Ok(());
        }
        self.current_mode = mode;
        self.current_intent = intent;
        self.apply_pending = true;
        Ok(())
    }

    /// Forces the next [`apply_current`](Self::apply_current) to reprogram the profile
    pub fn reapply_mode(&mut self) {
        self.apply_pending = true;
    }

    /// Resolves the profile for the current mode and the frame's dynamic range
    ///
    /// Returns `None` when nothing matches.
    pub fn resolve(&self, range: DynamicRange) -> Option<&str> {
        let mode = self.current_mode;
        let intent = self.current_intent;

        if let Some(name) = self.preferred.get(&(mode, range)) {
            return Some(name.as_str());
        }

        let mut name = self.lookup(mode, intent, range);
        if name.is_none() && range == DynamicRange::Hdr {
            name = self.lookup(mode, RenderIntent::COLORIMETRIC, DynamicRange::Hdr);
        }
        if name.is_none()
            && range == DynamicRange::Hdr
            && matches!(
                mode,
                ColorMode::DisplayP3 | ColorMode::DisplayBt2020 | ColorMode::Native
            )
        {
            name = self.lookup(mode, intent, DynamicRange::Sdr);
        }
        if name.is_none() && range == DynamicRange::Sdr && mode == ColorMode::Bt2100Pq {
            name = self.lookup(mode, intent, DynamicRange::Hdr);
        }
        name
    }

    /// Programs the profile matching the current mode and whether HDR content is on screen
    ///
    /// Does nothing if the display has no choice of profiles, or if neither the mode
    /// nor the dynamic range changed since the last call.
    pub fn apply_current<E: ColorProfileSource + ?Sized>(
        &mut self,
        engine: &mut E,
        hdr_present: bool,
    ) -> Result<(), ColorError> {
        if self.table.len() <= 1 {
            return Ok(());
        }
        let range = if hdr_present {
            DynamicRange::Hdr
        } else {
            DynamicRange::Sdr
        };
        if !self.apply_pending && self.current_range == range {
            return Ok(());
        }
        self.apply_pending = false;
        self.current_range = range;

        let Some(name) = self.resolve(range).map(str::to_owned) else {
            warn!(mode = ?self.current_mode, intent = ?self.current_intent, ?range, "No profile to apply");
            return Err(ColorError::ModeUnsupported(self.current_mode));
        };
        if let Err(err) = engine.set_color_profile(&name) {
            warn!(profile = name.as_str(), ?err, "Failed to apply colour profile");
            return Err(ColorError::Engine(err));
        }
        self.restore_color_transform(engine)?;
        debug!(mode = ?self.current_mode, intent = ?self.current_intent, ?range, profile = name.as_str(), "Applied colour profile");
        Ok(())
    }

    /// Sets a profile by name on behalf of a client
    ///
    /// The profile is remembered as the preferred one for its (mode, range) pair and
    /// applied right away if that pair is the one currently on screen.
    pub fn set_preferred_from_client<E: ColorProfileSource + ?Sized>(
        &mut self,
        engine: &mut E,
        name: &str,
    ) -> Result<(), ColorError> {
        let attrs = engine.color_profile_attributes(name).map_err(|err| {
            warn!(profile = name, ?err, "Failed to query profile attributes");
            ColorError::InvalidProfile(name.to_owned())
        })?;
        let attrs = ProfileAttributes::parse(&attrs);
        let (Some(gamut), Some(range)) = (attrs.gamut.as_deref(), attrs.range.as_deref()) else {
            return Err(ColorError::InvalidProfile(name.to_owned()));
        };

        let mode = match gamut {
            GAMUT_DCIP3 => ColorMode::DisplayP3,
            GAMUT_SRGB => ColorMode::Srgb,
            _ => ColorMode::Native,
        };
        let range = if range == RANGE_HDR {
            DynamicRange::Hdr
        } else {
            DynamicRange::Sdr
        };

        if self.current_mode == mode && self.current_range == range {
            info!(profile = name, "Applying client colour profile");
            engine
                .set_color_profile(name)
                .map_err(|_| ColorError::InvalidProfile(name.to_owned()))?;
            self.restore_color_transform(engine)?;
        }
        self.preferred.insert((mode, range), name.to_owned());
        Ok(())
    }

    /// Stores and programs a display-wide colour transform
    ///
    /// The matrix is kept even if the engine rejects it, so it is restored on the next
    /// profile switch.
    pub fn set_color_transform<E: ColorProfileSource + ?Sized>(
        &mut self,
        engine: &mut E,
        matrix: &ColorMatrix,
    ) -> Result<(), ColorError> {
        let result = engine.set_color_transform(matrix).map_err(ColorError::Engine);
        self.color_matrix = *matrix;
        result
    }

    /// Reprograms the last client colour transform
    ///
    /// Switching profiles resets the transform on the engine side.
    pub fn restore_color_transform<E: ColorProfileSource + ?Sized>(
        &self,
        engine: &mut E,
    ) -> Result<(), ColorError> {
        engine
            .set_color_transform(&self.color_matrix)
            .map_err(ColorError::Engine)
    }
}
