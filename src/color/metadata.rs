use super::ColorError;

/// Maximum size of an HDR10+ dynamic metadata payload, in bytes
pub const HDR_DYNAMIC_METADATA_SIZE: usize = 1024;

/// Chromaticity of the three primaries a buffer was mastered in
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ColorPrimaries {
    #[default]
    Bt709,
    Bt470M,
    Bt601_625,
    Bt601_525,
    Smpte240M,
    GenericFilm,
    Bt2020,
    SmpteSt428,
    AdobeRgb,
    DciP3,
    Ebu3213,
}

/// Opto-electronic transfer characteristic
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GammaTransfer {
    #[default]
    Srgb,
    Gamma2_2,
    Gamma2_8,
    Smpte170M,
    Smpte240M,
    Linear,
    Log,
    Bt2020_10Bit,
    St2084,
    Hlg,
}

/// Quantisation range of the encoded samples
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ColorRange {
    #[default]
    Limited,
    Full,
    Extended,
}

/// A (primaries, transfer, range) triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ColorSpace {
    /// Primaries
    pub primaries: ColorPrimaries,
    /// Transfer function
    pub transfer: GammaTransfer,
    /// Sample range
    pub range: ColorRange,
}

impl ColorSpace {
    /// BT.2020 primaries with a PQ or HLG transfer
    pub fn is_hdr(&self) -> bool {
        self.primaries == ColorPrimaries::Bt2020
            && matches!(self.transfer, GammaTransfer::St2084 | GammaTransfer::Hlg)
    }
}

/// Static mastering display colour volume (SMPTE ST 2086)
///
/// Chromaticities are stored in units of 0.00002, minimum luminance in units of 0.0001 nit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MasteringDisplay {
    /// Red, green, blue primaries as (x, y)
    pub primaries: [[u32; 2]; 3],
    /// White point as (x, y)
    pub white_point: [u32; 2],
    /// Peak luminance in nits
    pub max_luminance: u32,
    /// Minimum luminance
    pub min_luminance: u32,
}

/// Content light level information (CTA-861.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ContentLightLevel {
    /// MaxCLL in nits
    pub max_content_light_level: u32,
    /// MaxFALL in nits
    pub max_frame_average_light_level: u32,
}

/// Everything known about how a buffer's samples map to colours
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ColorMetadata {
    /// The colour space triple
    pub space: ColorSpace,
    /// Matrix coefficients used for YUV conversion, opaque
    pub matrix_coefficients: u32,
    /// Mastering display volume, if signalled
    pub mastering_display: Option<MasteringDisplay>,
    /// Light levels, if signalled
    pub content_light_level: Option<ContentLightLevel>,
    /// HDR10+ dynamic metadata payload, if signalled
    pub dynamic_metadata: Option<Vec<u8>>,
}

/// Colour space tag used by buffers that carry no full colour metadata
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LegacyColorSpace {
    Bt601,
    Bt601Full,
    Bt709,
    Bt709Full,
    Bt2020,
    Bt2020Full,
    Other(i32),
}

impl ColorMetadata {
    /// Derives colour metadata from a legacy colour space tag
    ///
    /// Fields not implied by the tag are taken from `current`.
    pub fn from_legacy(legacy: LegacyColorSpace, current: &ColorMetadata) -> Result<Self, ColorError> {
        let mut metadata = current.clone();
        if matches!(
            legacy,
            LegacyColorSpace::Bt601Full | LegacyColorSpace::Bt709Full | LegacyColorSpace::Bt2020Full
        ) {
            metadata.space.range = ColorRange::Full;
        }
        metadata.space.transfer = GammaTransfer::Srgb;
        metadata.space.primaries = match legacy {
            // video and display drivers use 525 lines for 601
            LegacyColorSpace::Bt601 | LegacyColorSpace::Bt601Full => ColorPrimaries::Bt601_525,
            LegacyColorSpace::Bt709 | LegacyColorSpace::Bt709Full => ColorPrimaries::Bt709,
            LegacyColorSpace::Bt2020 | LegacyColorSpace::Bt2020Full => ColorPrimaries::Bt2020,
            LegacyColorSpace::Other(raw) => return Err(ColorError::UnsupportedLegacy(raw)),
        };
        Ok(metadata)
    }
}

/// Keys of the float valued per-frame HDR metadata
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PerFrameMetadataKey {
    DisplayRedPrimaryX,
    DisplayRedPrimaryY,
    DisplayGreenPrimaryX,
    DisplayGreenPrimaryY,
    DisplayBluePrimaryX,
    DisplayBluePrimaryY,
    WhitePointX,
    WhitePointY,
    MaxLuminance,
    MinLuminance,
    MaxContentLightLevel,
    MaxFrameAverageLightLevel,
    /// Blob valued: HDR10+ SEI payload
    Hdr10PlusSei,
}
