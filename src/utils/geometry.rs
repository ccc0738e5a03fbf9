//! Coordinates of layers and buffers
//!
//! Every geometric type is tagged with the space it lives in. Display frames are
//! [`Physical`], source crops and damage are in [`Buffer`] coordinates, and the type
//! system keeps the two apart.

use std::fmt;
use std::marker::PhantomData;
use std::ops::{Add, Sub};

/// Marker for display (panel) coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Physical;

/// Marker for coordinates inside a client buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Buffer;

/// Numeric types usable as a coordinate
pub trait Coordinate:
    Sized + Add<Self, Output = Self> + Sub<Self, Output = Self> + PartialOrd + Default + Copy + fmt::Debug
{
    /// The origin
    const ZERO: Self;

    /// Addition clamped to the numeric bounds
    fn saturating_add(self, other: Self) -> Self;

    /// The smaller of two values
    fn min(self, other: Self) -> Self {
        if other < self {
            other
        } else {
            self
        }
    }

    /// The larger of two values
    fn max(self, other: Self) -> Self {
        if other > self {
            other
        } else {
            self
        }
    }
}

impl Coordinate for i32 {
    const ZERO: i32 = 0;

    #[inline]
    fn saturating_add(self, other: i32) -> i32 {
        i32::saturating_add(self, other)
    }
}

impl Coordinate for u32 {
    const ZERO: u32 = 0;

    #[inline]
    fn saturating_add(self, other: u32) -> u32 {
        u32::saturating_add(self, other)
    }
}

impl Coordinate for f32 {
    const ZERO: f32 = 0.0;

    #[inline]
    fn saturating_add(self, other: f32) -> f32 {
        self + other
    }
}

/// A position
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Point<N, Kind> {
    /// horizontal coordinate
    pub x: N,
    /// vertical coordinate
    pub y: N,
    _kind: PhantomData<Kind>,
}

impl<N: fmt::Debug, Kind> fmt::Debug for Point<N, Kind> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Point").field("x", &self.x).field("y", &self.y).finish()
    }
}

impl<N, Kind> From<(N, N)> for Point<N, Kind> {
    #[inline]
    fn from((x, y): (N, N)) -> Point<N, Kind> {
        Point {
            x,
            y,
            _kind: PhantomData,
        }
    }
}

/// A width and a height
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Size<N, Kind> {
    /// width
    pub w: N,
    /// height
    pub h: N,
    _kind: PhantomData<Kind>,
}

impl<N: Coordinate, Kind> Size<N, Kind> {
    /// Whether either dimension is zero or negative
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.w <= N::ZERO || self.h <= N::ZERO
    }
}

impl<N: fmt::Debug, Kind> fmt::Debug for Size<N, Kind> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Size").field("w", &self.w).field("h", &self.h).finish()
    }
}

impl<N, Kind> From<(N, N)> for Size<N, Kind> {
    #[inline]
    fn from((w, h): (N, N)) -> Size<N, Kind> {
        Size {
            w,
            h,
            _kind: PhantomData,
        }
    }
}

/// A rectangle given by its top-left corner and its size
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Rectangle<N, Kind> {
    /// Top-left corner
    pub loc: Point<N, Kind>,
    /// Extent
    pub size: Size<N, Kind>,
}

impl<N: Coordinate, Kind> Rectangle<N, Kind> {
    /// Creates a rectangle from its top-left corner and size
    #[inline]
    pub fn new(loc: Point<N, Kind>, size: Size<N, Kind>) -> Self {
        Rectangle { loc, size }
    }

    /// Creates a rectangle at the origin
    #[inline]
    pub fn from_size(size: Size<N, Kind>) -> Self {
        Rectangle {
            loc: (N::ZERO, N::ZERO).into(),
            size,
        }
    }

    /// The empty rectangle at the origin
    #[inline]
    pub fn zero() -> Self {
        Self::from_size((N::ZERO, N::ZERO).into())
    }

    /// Creates a rectangle from its left, top, right and bottom edges
    #[inline]
    pub fn from_extremities(topleft: impl Into<Point<N, Kind>>, bottomright: impl Into<Point<N, Kind>>) -> Self {
        let topleft = topleft.into();
        let bottomright = bottomright.into();
        let size = (bottomright.x - topleft.x, bottomright.y - topleft.y).into();
        Rectangle { loc: topleft, size }
    }

    /// Left edge
    #[inline]
    pub fn left(&self) -> N {
        self.loc.x
    }

    /// Top edge
    #[inline]
    pub fn top(&self) -> N {
        self.loc.y
    }

    /// Right edge, exclusive
    #[inline]
    pub fn right(&self) -> N {
        self.loc.x.saturating_add(self.size.w)
    }

    /// Bottom edge, exclusive
    #[inline]
    pub fn bottom(&self) -> N {
        self.loc.y.saturating_add(self.size.h)
    }

    /// Whether the rectangle covers no area
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size.is_empty()
    }

    /// The bounding box of both rectangles
    ///
    /// Empty rectangles do not contribute, so merging into [`Rectangle::zero`] starts a
    /// bounding box.
    pub fn merge(self, other: Self) -> Self {
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return self;
        }
        Rectangle::from_extremities(
            (self.left().min(other.left()), self.top().min(other.top())),
            (self.right().max(other.right()), self.bottom().max(other.bottom())),
        )
    }
}

impl<Kind> Rectangle<f32, Kind> {
    /// Shrinks the rectangle to whole pixels: left and top are rounded up,
    /// right and bottom are rounded down.
    ///
    /// A crop of `0.4..99.6` becomes `1..99`, so sub-pixel edges are never sampled.
    pub fn round_inward(self) -> Rectangle<f32, Kind> {
        Rectangle::from_extremities(
            (self.left().ceil(), self.top().ceil()),
            (self.right().floor(), self.bottom().floor()),
        )
    }

    /// Whether every edge lies on the integer grid
    pub fn is_integral(&self) -> bool {
        [self.left(), self.top(), self.right(), self.bottom()]
            .iter()
            .all(|v| v.fract() == 0.0)
    }

    /// Truncates every edge to an integer
    pub fn to_i32(self) -> Rectangle<i32, Kind> {
        Rectangle::from_extremities(
            (self.left() as i32, self.top() as i32),
            (self.right() as i32, self.bottom() as i32),
        )
    }
}

impl<N: fmt::Debug, Kind> fmt::Debug for Rectangle<N, Kind> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rectangle")
            .field("x", &self.loc.x)
            .field("y", &self.loc.y)
            .field("width", &self.size.w)
            .field("height", &self.size.h)
            .finish()
    }
}

/// Orientation of a layer's content on the display
#[derive(Debug, Default, PartialEq, Eq, Hash, Clone, Copy)]
pub enum Transform {
    /// Unaltered
    #[default]
    Normal,
    /// Rotated by 90 degrees
    _90,
    /// Rotated by 180 degrees
    _180,
    /// Rotated by 270 degrees
    _270,
    /// Flipped horizontally
    Flipped,
    /// Flipped horizontally, then rotated by 90 degrees
    Flipped90,
    /// Flipped vertically
    Flipped180,
    /// Flipped vertically, then rotated by 90 degrees
    Flipped270,
}

impl Transform {
    const FLIP_H: u32 = 0x1;
    const FLIP_V: u32 = 0x2;
    const ROT_90: u32 = 0x4;
    const ROT_180: u32 = Self::FLIP_H | Self::FLIP_V;
    const ROT_270: u32 = Self::ROT_180 | Self::ROT_90;

    /// Decodes a composer transform bitfield
    ///
    /// Returns `None` for combinations outside the eight plane orientations.
    pub fn from_raw(raw: u32) -> Option<Transform> {
        Some(match raw {
            0 => Transform::Normal,
            Self::FLIP_H => Transform::Flipped,
            Self::FLIP_V => Transform::Flipped180,
            Self::ROT_90 => Transform::_90,
            Self::ROT_180 => Transform::_180,
            Self::ROT_270 => Transform::_270,
            r if r == Self::FLIP_H | Self::ROT_90 => Transform::Flipped90,
            r if r == Self::FLIP_V | Self::ROT_90 => Transform::Flipped270,
            _ => return None,
        })
    }

    /// Whether the hardware has to rotate the plane by a quarter turn
    pub fn rotates(&self) -> bool {
        matches!(
            self,
            Transform::_90 | Transform::_270 | Transform::Flipped90 | Transform::Flipped270
        )
    }

    /// Size of `size` after applying the transform
    pub fn transform_size<N: Coordinate, Kind>(&self, size: Size<N, Kind>) -> Size<N, Kind> {
        if self.rotates() {
            (size.h, size.w).into()
        } else {
            size
        }
    }
}
