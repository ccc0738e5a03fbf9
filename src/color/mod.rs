//! Colour handling
//!
//! This module covers the two sides of colour management a composer deals with:
//!
//! - describing the colour space of a single buffer, either as a compact [`Dataspace`]
//!   handed in by the client or as full [`ColorMetadata`] read from the buffer itself,
//! - picking the display wide colour profile, through the [`ColorModeManager`].
//!
//! Converting between a [`Dataspace`] and a [`ColorSpace`] is a partial round trip: every
//! triple one side can represent maps to exactly one value on the other side, and triples
//! outside that set fail in both directions.

mod dataspace;
mod metadata;
mod mode;

pub use self::dataspace::Dataspace;
pub use self::metadata::{
    ColorMetadata, ColorPrimaries, ColorRange, ColorSpace, ContentLightLevel, GammaTransfer,
    LegacyColorSpace, MasteringDisplay, PerFrameMetadataKey, HDR_DYNAMIC_METADATA_SIZE,
};
pub use self::mode::{ColorMode, ColorModeManager, ColorProfileSource, DynamicRange, RenderIntent};

use crate::engine::EngineError;

/// A 4x4 row-major colour transform
pub type ColorMatrix = [f32; 16];

/// The transform that leaves colours untouched
pub const IDENTITY_MATRIX: ColorMatrix = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0, //
];

/// Errors of the colour subsystem
#[derive(Debug, thiserror::Error)]
pub enum ColorError {
    /// The raw value is not a known colour mode
    #[error("color mode {0} is out of range")]
    InvalidMode(i32),
    /// The display has no profile for this mode
    #[error("color mode {0:?} is not supported")]
    ModeUnsupported(ColorMode),
    /// The mode exists, but not with this render intent
    #[error("render intent {intent:?} is not supported in color mode {mode:?}")]
    IntentUnsupported {
        /// The requested mode
        mode: ColorMode,
        /// The requested intent
        intent: RenderIntent,
    },
    /// The profile is unknown or lacks the attributes needed to classify it
    #[error("invalid color profile `{0}`")]
    InvalidProfile(String),
    /// The dataspace does not decode into a supported triple
    #[error("dataspace {0:?} is not supported")]
    NotSupported(Dataspace),
    /// The triple has no dataspace encoding
    #[error("color space {0:?} has no dataspace encoding")]
    UnsupportedColorSpace(ColorSpace),
    /// The legacy colour space tag is not one we can map
    #[error("legacy color space {0} is not supported")]
    UnsupportedLegacy(i32),
    /// The engine rejected the request
    #[error("the composition engine rejected the request")]
    Engine(#[source] EngineError),
}
