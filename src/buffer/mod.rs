//! Client buffers and their metadata
//!
//! Buffers are allocated and owned by the client. A layer only ever keeps a
//! [`BufferDescriptor`], a duplicate of the buffer's file descriptor that is closed exactly
//! once when the descriptor is dropped or replaced. Everything else about a buffer, its
//! format, its size, its colour metadata, is queried from a [`BufferMetadataProvider`].
//!
//! Provider failures are never fatal: a field that cannot be read is logged and treated as
//! unavailable, and the caller keeps whatever it knew before.

use std::io;
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};

use tracing::warn;

use crate::color::{ColorMetadata, LegacyColorSpace};
use crate::utils::{Buffer as BufferCoords, Size};

pub mod format;

pub use drm_fourcc::{DrmFourcc as Fourcc, DrmModifier as Modifier};

/// A buffer handed in by the client for the duration of one call
#[derive(Debug, Clone, Copy)]
pub struct BufferRef<'a> {
    /// Unique identity of the underlying allocation
    pub id: u64,
    /// The buffer's file descriptor, still owned by the client
    pub fd: BorrowedFd<'a>,
}

impl<'a> BufferRef<'a> {
    /// Wraps a client buffer
    pub fn new(id: u64, fd: BorrowedFd<'a>) -> Self {
        BufferRef { id, fd }
    }
}

/// An owned duplicate of a client buffer's file descriptor
#[derive(Debug)]
pub struct BufferDescriptor {
    id: u64,
    fd: OwnedFd,
}

impl BufferDescriptor {
    /// Duplicates the descriptor of `buffer`
    pub fn duplicate(buffer: BufferRef<'_>) -> io::Result<Self> {
        Ok(BufferDescriptor {
            id: buffer.id,
            fd: buffer.fd.try_clone_to_owned()?,
        })
    }

    /// Identity of the allocation this descriptor refers to
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Borrows this descriptor as a [`BufferRef`]
    pub fn as_buffer_ref(&self) -> BufferRef<'_> {
        BufferRef {
            id: self.id,
            fd: self.fd.as_fd(),
        }
    }
}

impl AsFd for BufferDescriptor {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

bitflags::bitflags! {
    /// Allocator private flags of a buffer
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PrivateFlags: u32 {
        /// Content is protected and only readable by secure hardware
        const SECURE_BUFFER = 0x0000_0400;
        /// Content may only be shown on a secure display path
        const SECURE_DISPLAY = 0x0100_0000;
        /// Written by the camera
        const CAMERA_WRITE = 0x0020_0000;
        /// Bandwidth compressed layout
        const UBWC_ALIGNED = 0x0800_0000;
        /// Content is produced by a video decoder
        const VIDEO_ENCODER = 0x0001_0000;
    }
}

bitflags::bitflags! {
    /// Usage the client allocated a buffer with
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferUsage: u64 {
        /// Read by the CPU rarely
        const CPU_READ_RARELY = 2;
        /// Read by the CPU often
        const CPU_READ_OFTEN = 3;
        /// Sampled by the GPU
        const GPU_TEXTURE = 1 << 8;
        /// Rendered to by the GPU
        const GPU_RENDER_TARGET = 1 << 9;
        /// Scanned out directly
        const COMPOSER_OVERLAY = 1 << 11;
        /// Protected content
        const PROTECTED = 1 << 14;
        /// Produced by a video decoder
        const VIDEO_DECODER = 1 << 22;
        /// Rendered to while being scanned out
        const FRONT_BUFFER = 1 << 32;
    }
}

/// Content kind of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BufferType {
    /// Anything that is not video
    #[default]
    Ui,
    /// Decoded video
    Video,
}

/// Failure to read a field from a buffer's metadata
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    /// The buffer carries no value for this field
    #[error("metadata field is not available")]
    Unavailable,
    /// Reading the metadata failed
    #[error("failed to read buffer metadata")]
    Io(#[from] io::Error),
}

/// Source of per-buffer metadata
///
/// Mandatory fields have no default implementation; optional ones report
/// [`MetadataError::Unavailable`] unless overridden.
pub trait BufferMetadataProvider: std::fmt::Debug + Send + Sync {
    /// The pixel format of the buffer
    fn format(&self, buffer: BufferRef<'_>) -> Result<Fourcc, MetadataError>;
    /// Dimensions including the allocator's padding
    fn aligned_size(&self, buffer: BufferRef<'_>) -> Result<Size<u32, BufferCoords>, MetadataError>;
    /// Dimensions the client asked for
    fn unaligned_size(&self, buffer: BufferRef<'_>) -> Result<Size<u32, BufferCoords>, MetadataError>;
    /// Size of the allocation in bytes
    fn allocation_size(&self, buffer: BufferRef<'_>) -> Result<u64, MetadataError>;

    /// Allocator private flags
    fn private_flags(&self, _buffer: BufferRef<'_>) -> Result<PrivateFlags, MetadataError> {
        Err(MetadataError::Unavailable)
    }
    /// Allocation usage
    fn usage(&self, _buffer: BufferRef<'_>) -> Result<BufferUsage, MetadataError> {
        Err(MetadataError::Unavailable)
    }
    /// Content kind
    fn buffer_type(&self, _buffer: BufferRef<'_>) -> Result<BufferType, MetadataError> {
        Err(MetadataError::Unavailable)
    }
    /// Full colour metadata
    fn color_metadata(&self, _buffer: BufferRef<'_>) -> Result<ColorMetadata, MetadataError> {
        Err(MetadataError::Unavailable)
    }
    /// Legacy colour space tag, for buffers without full colour metadata
    fn legacy_color_space(&self, _buffer: BufferRef<'_>) -> Result<LegacyColorSpace, MetadataError> {
        Err(MetadataError::Unavailable)
    }
    /// Content frame rate
    fn refresh_rate(&self, _buffer: BufferRef<'_>) -> Result<f32, MetadataError> {
        Err(MetadataError::Unavailable)
    }
    /// Whether the content is interlaced
    fn interlaced(&self, _buffer: BufferRef<'_>) -> Result<bool, MetadataError> {
        Err(MetadataError::Unavailable)
    }
    /// Whether producer and consumer share a single buffer
    fn single_buffer_mode(&self, _buffer: BufferRef<'_>) -> Result<bool, MetadataError> {
        Err(MetadataError::Unavailable)
    }
    /// Vendor specific content metadata
    fn extended_content_metadata(&self, _buffer: BufferRef<'_>) -> Result<Vec<u8>, MetadataError> {
        Err(MetadataError::Unavailable)
    }
}

/// Geometry and flags of a buffer, as cached by a layer
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BufferInfo {
    /// Pixel format, `None` if it could not be read
    pub format: Option<Fourcc>,
    /// Padded dimensions
    pub aligned_size: Size<u32, BufferCoords>,
    /// Requested dimensions
    pub unaligned_size: Size<u32, BufferCoords>,
    /// Allocation size in bytes
    pub allocation_size: u64,
    /// Private flags
    pub private_flags: PrivateFlags,
    /// Usage
    pub usage: BufferUsage,
    /// Content kind
    pub buffer_type: BufferType,
}

impl BufferInfo {
    /// Reads every field from `provider`
    ///
    /// Unreadable fields are logged and keep the value they have in `previous`.
    pub fn query<P: BufferMetadataProvider + ?Sized>(
        provider: &P,
        buffer: BufferRef<'_>,
        previous: &BufferInfo,
    ) -> BufferInfo {
        fn or_keep<T: Clone>(field: &str, result: Result<T, MetadataError>, previous: &T) -> T {
            match result {
                Ok(value) => value,
                Err(MetadataError::Unavailable) => previous.clone(),
                Err(err) => {
                    warn!(field, ?err, "Failed to retrieve buffer metadata");
                    previous.clone()
                }
            }
        }

        BufferInfo {
            format: or_keep("format", provider.format(buffer).map(Some), &previous.format),
            aligned_size: or_keep("aligned size", provider.aligned_size(buffer), &previous.aligned_size),
            unaligned_size: or_keep(
                "unaligned size",
                provider.unaligned_size(buffer),
                &previous.unaligned_size,
            ),
            allocation_size: or_keep(
                "allocation size",
                provider.allocation_size(buffer),
                &previous.allocation_size,
            ),
            private_flags: or_keep("private flags", provider.private_flags(buffer), &PrivateFlags::empty()),
            usage: or_keep("usage", provider.usage(buffer), &BufferUsage::empty()),
            buffer_type: or_keep("buffer type", provider.buffer_type(buffer), &BufferType::Ui),
        }
    }

    /// Secure buffer flag
    pub fn is_secure(&self) -> bool {
        self.private_flags.contains(PrivateFlags::SECURE_BUFFER)
    }

    /// Secure camera buffer
    pub fn is_secure_camera(&self) -> bool {
        self.is_secure() && self.private_flags.contains(PrivateFlags::CAMERA_WRITE)
    }

    /// Secure display flag
    pub fn is_secure_display(&self) -> bool {
        self.private_flags.contains(PrivateFlags::SECURE_DISPLAY)
    }
}
