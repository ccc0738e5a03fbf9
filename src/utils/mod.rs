//! Various utilities functions and types

pub mod clock;
mod geometry;
mod ids;

pub use self::clock::{Clock, Monotonic, Time};
pub use self::geometry::{Buffer, Coordinate, Physical, Point, Rectangle, Size, Transform};
pub use self::ids::{DisplayId, LayerId, LayerIdAllocator};
