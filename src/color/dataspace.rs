use std::fmt;

use super::{ColorError, ColorPrimaries, ColorRange, ColorSpace, GammaTransfer};

const STANDARD_SHIFT: i32 = 16;
const TRANSFER_SHIFT: i32 = 22;
const RANGE_SHIFT: i32 = 27;

const STANDARD_MASK: i32 = 63 << STANDARD_SHIFT;
const TRANSFER_MASK: i32 = 31 << TRANSFER_SHIFT;
const RANGE_MASK: i32 = 7 << RANGE_SHIFT;

const STANDARD_BT709: i32 = 1 << STANDARD_SHIFT;
const STANDARD_BT601_625: i32 = 2 << STANDARD_SHIFT;
const STANDARD_BT601_625_UNADJUSTED: i32 = 3 << STANDARD_SHIFT;
const STANDARD_BT601_525: i32 = 4 << STANDARD_SHIFT;
const STANDARD_BT601_525_UNADJUSTED: i32 = 5 << STANDARD_SHIFT;
const STANDARD_BT2020: i32 = 6 << STANDARD_SHIFT;
const STANDARD_BT470M: i32 = 8 << STANDARD_SHIFT;
const STANDARD_FILM: i32 = 9 << STANDARD_SHIFT;
const STANDARD_DCI_P3: i32 = 10 << STANDARD_SHIFT;
const STANDARD_ADOBE_RGB: i32 = 11 << STANDARD_SHIFT;

const TRANSFER_LINEAR: i32 = 1 << TRANSFER_SHIFT;
const TRANSFER_SRGB: i32 = 2 << TRANSFER_SHIFT;
const TRANSFER_SMPTE_170M: i32 = 3 << TRANSFER_SHIFT;
const TRANSFER_GAMMA2_2: i32 = 4 << TRANSFER_SHIFT;
const TRANSFER_GAMMA2_8: i32 = 6 << TRANSFER_SHIFT;
const TRANSFER_ST2084: i32 = 7 << TRANSFER_SHIFT;
const TRANSFER_HLG: i32 = 8 << TRANSFER_SHIFT;

const RANGE_FULL: i32 = 1 << RANGE_SHIFT;
const RANGE_LIMITED: i32 = 2 << RANGE_SHIFT;
const RANGE_EXTENDED: i32 = 3 << RANGE_SHIFT;

// Pre-V0 dataspaces, identified by a non-zero low half-word.
const LEGACY_SRGB_LINEAR: i32 = 0x200;
const LEGACY_SRGB: i32 = 0x201;
const LEGACY_JFIF: i32 = 0x101;
const LEGACY_BT601_625: i32 = 0x102;
const LEGACY_BT601_525: i32 = 0x103;
const LEGACY_BT709: i32 = 0x104;

/// An encoded (standard, transfer, range) triple as exchanged with the client
///
/// The value is kept raw: clients may hand in combinations this crate does not
/// understand, which is only an error once something tries to interpret them.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Dataspace(pub i32);

impl Dataspace {
    /// No dataspace was set
    pub const UNKNOWN: Dataspace = Dataspace(0);
    /// sRGB, full range
    pub const V0_SRGB: Dataspace = Dataspace(STANDARD_BT709 | TRANSFER_SRGB | RANGE_FULL);
    /// Linear sRGB, full range
    pub const V0_SRGB_LINEAR: Dataspace = Dataspace(STANDARD_BT709 | TRANSFER_LINEAR | RANGE_FULL);
    /// JPEG File Interchange Format
    pub const V0_JFIF: Dataspace = Dataspace(STANDARD_BT601_625 | TRANSFER_SMPTE_170M | RANGE_FULL);
    /// BT.601 625 lines, limited range
    pub const V0_BT601_625: Dataspace =
        Dataspace(STANDARD_BT601_625 | TRANSFER_SMPTE_170M | RANGE_LIMITED);
    /// BT.601 525 lines, limited range
    pub const V0_BT601_525: Dataspace =
        Dataspace(STANDARD_BT601_525 | TRANSFER_SMPTE_170M | RANGE_LIMITED);
    /// BT.709, limited range
    pub const V0_BT709: Dataspace = Dataspace(STANDARD_BT709 | TRANSFER_SMPTE_170M | RANGE_LIMITED);
    /// Display P3
    pub const DISPLAY_P3: Dataspace = Dataspace(STANDARD_DCI_P3 | TRANSFER_SRGB | RANGE_FULL);
    /// BT.2020 with sRGB transfer
    pub const DISPLAY_BT2020: Dataspace = Dataspace(STANDARD_BT2020 | TRANSFER_SRGB | RANGE_FULL);
    /// BT.2100 PQ
    pub const BT2020_PQ: Dataspace = Dataspace(STANDARD_BT2020 | TRANSFER_ST2084 | RANGE_FULL);
    /// BT.2100 HLG
    pub const BT2020_HLG: Dataspace = Dataspace(STANDARD_BT2020 | TRANSFER_HLG | RANGE_FULL);

    /// Maps pre-V0 dataspace values onto their V0 encoding
    ///
    /// [`Dataspace::UNKNOWN`] is treated as sRGB. Unrecognised legacy values pass through unchanged.
    pub fn translate_legacy(self) -> Dataspace {
        let mut ds = self;
        if self.0 & 0xffff != 0 {
            ds = match self.0 & 0xffff {
                LEGACY_SRGB => Self::V0_SRGB,
                LEGACY_JFIF => Self::V0_JFIF,
                LEGACY_SRGB_LINEAR => Self::V0_SRGB_LINEAR,
                LEGACY_BT601_625 => Self::V0_BT601_625,
                LEGACY_BT601_525 => Self::V0_BT601_525,
                LEGACY_BT709 => Self::V0_BT709,
                _ => self,
            };
        }
        if ds == Self::UNKNOWN {
            ds = Self::V0_SRGB;
        }
        ds
    }

    /// Decodes the triple carried by this dataspace
    pub fn to_color_space(self) -> Result<ColorSpace, ColorError> {
        let primaries = match self.0 & STANDARD_MASK {
            STANDARD_BT709 => ColorPrimaries::Bt709,
            STANDARD_BT601_525 | STANDARD_BT601_525_UNADJUSTED => ColorPrimaries::Bt601_525,
            STANDARD_BT601_625 | STANDARD_BT601_625_UNADJUSTED => ColorPrimaries::Bt601_625,
            STANDARD_DCI_P3 => ColorPrimaries::DciP3,
            STANDARD_BT2020 => ColorPrimaries::Bt2020,
            STANDARD_BT470M => ColorPrimaries::Bt470M,
            STANDARD_FILM => ColorPrimaries::GenericFilm,
            STANDARD_ADOBE_RGB => ColorPrimaries::AdobeRgb,
            _ => return Err(ColorError::NotSupported(self)),
        };
        let transfer = match self.0 & TRANSFER_MASK {
            TRANSFER_SRGB => GammaTransfer::Srgb,
            TRANSFER_SMPTE_170M => GammaTransfer::Smpte170M,
            TRANSFER_ST2084 => GammaTransfer::St2084,
            TRANSFER_HLG => GammaTransfer::Hlg,
            TRANSFER_LINEAR => GammaTransfer::Linear,
            TRANSFER_GAMMA2_2 => GammaTransfer::Gamma2_2,
            TRANSFER_GAMMA2_8 => GammaTransfer::Gamma2_8,
            _ => return Err(ColorError::NotSupported(self)),
        };
        let range = match self.0 & RANGE_MASK {
            RANGE_FULL => ColorRange::Full,
            RANGE_LIMITED => ColorRange::Limited,
            RANGE_EXTENDED => ColorRange::Extended,
            _ => return Err(ColorError::NotSupported(self)),
        };
        Ok(ColorSpace {
            primaries,
            transfer,
            range,
        })
    }
}

impl ColorSpace {
    /// Encodes this triple as a dataspace
    ///
    /// Fails for exactly the triples [`Dataspace::to_color_space`] can never produce.
    pub fn to_dataspace(&self) -> Result<Dataspace, ColorError> {
        let standard = match self.primaries {
            ColorPrimaries::Bt709 => STANDARD_BT709,
            ColorPrimaries::Bt470M => STANDARD_BT470M,
            ColorPrimaries::Bt601_625 => STANDARD_BT601_625,
            ColorPrimaries::Bt601_525 => STANDARD_BT601_525,
            ColorPrimaries::GenericFilm => STANDARD_FILM,
            ColorPrimaries::Bt2020 => STANDARD_BT2020,
            ColorPrimaries::AdobeRgb => STANDARD_ADOBE_RGB,
            ColorPrimaries::DciP3 => STANDARD_DCI_P3,
            ColorPrimaries::Smpte240M | ColorPrimaries::SmpteSt428 | ColorPrimaries::Ebu3213 => {
                return Err(ColorError::UnsupportedColorSpace(*self))
            }
        };
        let transfer = match self.transfer {
            GammaTransfer::Srgb => TRANSFER_SRGB,
            GammaTransfer::Gamma2_2 => TRANSFER_GAMMA2_2,
            GammaTransfer::Gamma2_8 => TRANSFER_GAMMA2_8,
            GammaTransfer::Smpte170M => TRANSFER_SMPTE_170M,
            GammaTransfer::Linear => TRANSFER_LINEAR,
            GammaTransfer::St2084 => TRANSFER_ST2084,
            GammaTransfer::Hlg => TRANSFER_HLG,
            GammaTransfer::Smpte240M | GammaTransfer::Log | GammaTransfer::Bt2020_10Bit => {
                return Err(ColorError::UnsupportedColorSpace(*self))
            }
        };
        let range = match self.range {
            ColorRange::Full => RANGE_FULL,
            ColorRange::Limited => RANGE_LIMITED,
            ColorRange::Extended => RANGE_EXTENDED,
        };
        Ok(Dataspace(standard | transfer | range))
    }
}

impl fmt::Debug for Dataspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dataspace({:#x})", self.0)
    }
}
