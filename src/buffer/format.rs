//! Format info tables for the pixel formats a layer may carry.
//!
//! [`is_yuv`] returns true for formats that need a colour space conversion before blending.
//!
//! ```
//! # use hwcomposer::buffer::{format::is_yuv, Fourcc};
//! assert!(is_yuv(Fourcc::Nv12));
//! assert!(!is_yuv(Fourcc::Abgr8888));
//! ```
//!
//! [`get_bpp`] returns the number of bits per pixel of a format, for planar formats the
//! average over all planes.
//!
//! ```
//! # use hwcomposer::buffer::{format::get_bpp, Fourcc};
//! assert_eq!(get_bpp(Fourcc::Abgr8888), Some(32));
//! assert_eq!(get_bpp(Fourcc::Nv12), Some(12));
//! ```
//!
//! [`name`] returns the short name used in dump file names.

use super::Fourcc;

macro_rules! format_tables {
    (
        $($fourcc: ident {
            name: $name: expr,
            yuv: $yuv: expr,
            float: $float: expr,
            bpp: $bpp: expr $(,)?
        }),* $(,)?
    ) => {
        /// Returns true if the format stores luma and chroma samples.
        ///
        /// Unknown formats will always return `false`.
        pub const fn is_yuv(fourcc: Fourcc) -> bool {
            match fourcc {
                $(Fourcc::$fourcc => $yuv,)*
                _ => false,
            }
        }

        /// Returns true if the format stores half float samples.
        ///
        /// Such buffers can carry extended range content.
        pub const fn is_floating_point(fourcc: Fourcc) -> bool {
            match fourcc {
                $(Fourcc::$fourcc => $float,)*
                _ => false,
            }
        }

        /// Returns the bits per pixel of the specified format.
        ///
        /// Unknown formats will always return [`None`].
        pub const fn get_bpp(fourcc: Fourcc) -> Option<usize> {
            match fourcc {
                $(Fourcc::$fourcc => Some($bpp),)*
                _ => None,
            }
        }

        /// Returns a short human readable name of the format.
        ///
        /// Unknown formats are reported as `"Unknown"`.
        pub const fn name(fourcc: Fourcc) -> &'static str {
            match fourcc {
                $(Fourcc::$fourcc => $name,)*
                _ => "Unknown",
            }
        }

        #[cfg(test)]
        fn _impl_formats() -> &'static [Fourcc] {
            &[$(Fourcc::$fourcc,)*]
        }
    };
}

format_tables! {
    R8 { name: "A_8", yuv: false, float: false, bpp: 8 },

    Rgb565 { name: "RGB_565", yuv: false, float: false, bpp: 16 },
    Bgr565 { name: "BGR_565", yuv: false, float: false, bpp: 16 },

    Rgb888 { name: "BGR_888", yuv: false, float: false, bpp: 24 },
    Bgr888 { name: "RGB_888", yuv: false, float: false, bpp: 24 },

    Abgr8888 { name: "RGBA_8888", yuv: false, float: false, bpp: 32 },
    Xbgr8888 { name: "RGBX_8888", yuv: false, float: false, bpp: 32 },
    Argb8888 { name: "BGRA_8888", yuv: false, float: false, bpp: 32 },
    Xrgb8888 { name: "BGRX_8888", yuv: false, float: false, bpp: 32 },

    Abgr2101010 { name: "RGBA_1010102", yuv: false, float: false, bpp: 32 },
    Xbgr2101010 { name: "RGBX_1010102", yuv: false, float: false, bpp: 32 },
    Argb2101010 { name: "BGRA_1010102", yuv: false, float: false, bpp: 32 },
    Xrgb2101010 { name: "BGRX_1010102", yuv: false, float: false, bpp: 32 },

    Abgr16161616f { name: "RGBA_16161616F", yuv: false, float: true, bpp: 64 },
    Argb16161616f { name: "BGRA_16161616F", yuv: false, float: true, bpp: 64 },

    Nv12 { name: "YCbCr_420_SP", yuv: true, float: false, bpp: 12 },
    Nv21 { name: "YCrCb_420_SP", yuv: true, float: false, bpp: 12 },
    Nv16 { name: "YCbCr_422_SP", yuv: true, float: false, bpp: 16 },
    Yvu420 { name: "YV12", yuv: true, float: false, bpp: 12 },
    Yuyv { name: "YCbCr_422_I", yuv: true, float: false, bpp: 16 },
    P010 { name: "YCbCr_420_P010", yuv: true, float: false, bpp: 24 },
}
