//! Raw frame dumps
//!
//! A frame dump captures the next `count` composed frames of a display through the
//! concurrent writeback path and writes each of them verbatim to
//! `<dump dir>/frame_dump_disp_id_<NN>_<kind>/output_layer_<W>x<H>_<FMT>_frame<I>.raw`.
//!
//! The output buffer is allocated once through a [`DumpBufferAllocator`] and stays
//! mapped until the dump is finished.

use std::{
    fs, io,
    os::unix::{
        fs::PermissionsExt,
        io::{AsFd, OwnedFd},
    },
    path::{Path, PathBuf},
    ptr::{self, NonNull},
    slice,
};

use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use tracing::{debug, info, warn};

use crate::{
    buffer::{format, BufferRef, Fourcc},
    engine::CaptureConfig,
    sync::SyncPoint,
    utils::DisplayId,
};

/// Kind of display, as it appears in dump paths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DisplayKind {
    /// A panel built into the device
    #[default]
    Builtin,
    /// An external display
    Pluggable,
    /// A virtual display rendering into client buffers
    Virtual,
}

impl DisplayKind {
    /// Name used in dump directory names
    pub fn as_str(&self) -> &'static str {
        match self {
            DisplayKind::Builtin => "builtin",
            DisplayKind::Pluggable => "pluggable",
            DisplayKind::Virtual => "virtual",
        }
    }
}

/// A buffer allocated for writeback
#[derive(Debug)]
pub struct DumpBuffer {
    /// Unique identity of the allocation
    pub id: u64,
    /// Backing memory
    pub fd: OwnedFd,
    /// Aligned width in pixels
    pub width: u32,
    /// Aligned height in pixels
    pub height: u32,
    /// Pixel format
    pub format: Fourcc,
    /// Size of the allocation in bytes
    pub size: usize,
}

impl DumpBuffer {
    /// Borrowed handle for the engine
    pub fn as_buffer_ref(&self) -> BufferRef<'_> {
        BufferRef::new(self.id, self.fd.as_fd())
    }
}

/// Allocator of writeback buffers
pub trait DumpBufferAllocator: std::fmt::Debug + Send {
    /// Allocates a buffer of the given size and format
    fn allocate(&mut self, width: u32, height: u32, format: Fourcc) -> io::Result<DumpBuffer>;

    /// Releases a buffer handed out by [`allocate`](Self::allocate)
    fn free(&mut self, buffer: DumpBuffer);
}

#[derive(Debug)]
struct Mapping {
    ptr: NonNull<u8>,
    size: usize,
}

// SAFETY: the mapping is only accessed through `&mut FrameDump`
unsafe impl Send for Mapping {}

impl Mapping {
    fn new(fd: &OwnedFd, size: usize) -> io::Result<Mapping> {
        if size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty dump buffer"));
        }
        // SAFETY: a fresh shared mapping, nothing else aliases it within this process
        let ptr = unsafe {
            mmap(
                ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd,
                0,
            )
        }?;
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;
        Ok(Mapping { ptr, size })
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for size bytes until drop
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    fn clear(&mut self) {
        // SAFETY: see as_slice
        unsafe { ptr::write_bytes(self.ptr.as_ptr(), 0, self.size) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: unmapping exactly what `new` mapped
        if let Err(err) = unsafe { munmap(self.ptr.as_ptr().cast(), self.size) } {
            warn!(?err, "Failed to unmap dump buffer");
        }
    }
}

/// Directory frames of `display` are dumped into
pub fn dump_directory(base: &Path, display: DisplayId, kind: DisplayKind) -> PathBuf {
    base.join(format!("frame_dump_disp_id_{:02}_{}", display.0, kind.as_str()))
}

/// An active frame dump
#[derive(Debug)]
pub struct FrameDump {
    buffer: DumpBuffer,
    mapping: Mapping,
    config: CaptureConfig,
    directory: PathBuf,
    clear_after_dump: bool,
    remaining: u32,
    index: u32,
}

impl FrameDump {
    /// Maps `buffer` to dump `count` frames into `directory`
    ///
    /// On failure the buffer is handed back so it can be freed.
    pub fn new(
        buffer: DumpBuffer,
        count: u32,
        config: CaptureConfig,
        directory: PathBuf,
        kind: DisplayKind,
    ) -> Result<FrameDump, (DumpBuffer, io::Error)> {
        let mapping = match Mapping::new(&buffer.fd, buffer.size) {
            Ok(mapping) => mapping,
            Err(err) => return Err((buffer, err)),
        };
        Ok(FrameDump {
            buffer,
            mapping,
            config,
            directory,
            // virtual displays dump the client's own buffer, which must not be wiped
            clear_after_dump: kind != DisplayKind::Virtual,
            remaining: count,
            index: 0,
        })
    }

    /// The writeback buffer
    pub fn buffer(&self) -> &DumpBuffer {
        &self.buffer
    }

    /// Writeback parameters of every dumped frame
    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Index of the next frame written
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Frames left to dump, including the one in flight
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Path the next frame is written to
    pub fn frame_path(&self) -> PathBuf {
        self.directory.join(format!(
            "output_layer_{}x{}_{}_frame{}.raw",
            self.buffer.width,
            self.buffer.height,
            format::name(self.buffer.format),
            self.index
        ))
    }

    /// Writes the captured frame once `retire_fence` signalled
    ///
    /// The buffer is zeroed afterwards, so a frame that is not written by the next
    /// writeback shows up empty instead of repeating this one.
    #[profiling::function]
    pub fn write(&mut self, retire_fence: Option<&SyncPoint>) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.directory)?;
        // the directory may exist with a restrictive mode already
        fs::set_permissions(&self.directory, fs::Permissions::from_mode(0o777))?;

        if let Some(fence) = retire_fence {
            fence
                .wait()
                .map_err(|err| io::Error::new(io::ErrorKind::Interrupted, err))?;
        }

        let path = self.frame_path();
        fs::write(&path, self.mapping.as_slice())?;
        if self.clear_after_dump {
            self.mapping.clear();
        }
        info!(path = %path.display(), "Dumped frame");
        Ok(path)
    }

    /// Moves on to the next frame, returns `false` once every frame was dumped
    pub fn advance(&mut self) -> bool {
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            debug!(frames = self.index + 1, "Frame dump complete");
            return false;
        }
        self.index += 1;
        true
    }

    /// Unmaps the buffer and hands it back for freeing
    pub fn into_buffer(self) -> DumpBuffer {
        let FrameDump { buffer, mapping, .. } = self;
        drop(mapping);
        buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};

    fn buffer(size: usize) -> DumpBuffer {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&vec![0xab; size]).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        DumpBuffer {
            id: 1,
            fd: OwnedFd::from(file),
            width: 4,
            height: 2,
            format: Fourcc::Argb8888,
            size,
        }
    }

    #[test]
    fn directory_naming() {
        assert_eq!(
            dump_directory(Path::new("/dump"), DisplayId(1), DisplayKind::Pluggable),
            PathBuf::from("/dump/frame_dump_disp_id_01_pluggable")
        );
    }

    #[test]
    fn frames_are_written_and_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let directory = dump_directory(dir.path(), DisplayId(0), DisplayKind::Builtin);
        let mut dump = FrameDump::new(buffer(32), 2, CaptureConfig::default(), directory, DisplayKind::Builtin)
            .unwrap();

        let first = dump.write(Some(&SyncPoint::signaled())).unwrap();
        assert!(first.ends_with("output_layer_4x2_BGRA_8888_frame0.raw"));
        assert_eq!(fs::read(&first).unwrap(), vec![0xab; 32]);
        assert!(dump.advance());

        let second = dump.write(None).unwrap();
        assert!(second.ends_with("output_layer_4x2_BGRA_8888_frame1.raw"));
        assert_eq!(fs::read(&second).unwrap(), vec![0; 32]);
        assert!(!dump.advance());

        let buffer = dump.into_buffer();
        assert_eq!(buffer.size, 32);
    }

    #[test]
    fn virtual_displays_keep_content() {
        let dir = tempfile::tempdir().unwrap();
        let mut dump = FrameDump::new(
            buffer(8),
            2,
            CaptureConfig::default(),
            dir.path().join("virtual"),
            DisplayKind::Virtual,
        )
        .unwrap();
        dump.write(None).unwrap();
        dump.advance();
        let second = dump.write(None).unwrap();
        assert_eq!(fs::read(second).unwrap(), vec![0xab; 8]);
    }

    #[test]
    fn empty_buffer_is_handed_back() {
        let dir = tempfile::tempdir().unwrap();
        let (buffer, _) = FrameDump::new(
            buffer(0),
            1,
            CaptureConfig::default(),
            dir.path().to_owned(),
            DisplayKind::Builtin,
        )
        .unwrap_err();
        assert_eq!(buffer.id, 1);
    }
}
