//! Interface to the hardware composition engine
//!
//! The engine is the part of the display stack that actually programs the display
//! controller. A [`CompositionSession`](crate::session::CompositionSession) never touches
//! hardware directly: every frame it assembles a [`LayerStack`], hands it to the engine to
//! decide which layers can be composed by dedicated hardware, and later to commit it.
//!
//! The engine writes its decisions back into the stack:
//!
//! - [`StackLayer::composition`] after [`CompositionEngine::prepare`],
//! - [`StackBuffer::release_fence`], [`LayerStack::retire_fence`] and
//!   [`LayerStack::output_buffer`] after [`CompositionEngine::commit`].
//!
//! Failures are reported through the closed set of [`EngineError`] codes, which the
//! session classifies into silent drains, forced fallbacks or propagated errors.

use std::time::Duration;

use smallvec::SmallVec;

use crate::{
    buffer::{BufferRef, Fourcc},
    color::{ColorMatrix, ColorMetadata, ColorProfileSource, ColorSpace},
    sync::SyncPoint,
    utils::{Buffer as BufferCoords, LayerId, Physical, Rectangle, Transform},
};

/// Status codes of a failed engine operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum EngineError {
    /// The display was torn down externally
    #[error("The display is shutting down")]
    Shutdown,
    /// The operation is blocked, e.g. by a secure session transition
    #[error("The operation is not permitted right now")]
    Permission,
    /// Commit was attempted on a stack that was not validated
    #[error("The layer stack was not validated")]
    NotValidated,
    /// Hardware resources are exhausted
    #[error("Hardware resources are exhausted")]
    Resources,
    /// The operation was deferred to a later frame
    #[error("The operation was deferred")]
    Deferred,
    /// The parameters were rejected
    #[error("Invalid parameters")]
    Parameters,
    /// The operation is not supported by this display
    #[error("Operation not supported")]
    NotSupported,
    /// Any other failure
    #[error("Undefined engine failure")]
    Undefined,
}

/// Successful outcome of a prepare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrepareStatus {
    /// The stack was validated, or committed for [`CompositionEngine::commit_or_prepare`]
    Done,
    /// The stack was validated and still has to be committed
    NeedsCommit,
}

/// How the engine decided to compose a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LayerComposition {
    /// Composed by the client on the GPU
    #[default]
    Gpu,
    /// The client target the GPU composed layers are rendered into
    GpuTarget,
    /// Fetched by a hardware pipe
    Hardware,
    /// Composed on a hardware cursor pipe
    Cursor,
    /// Stitched into a shared target by a blit engine
    Stitch,
}

bitflags::bitflags! {
    /// Per-layer hints derived by the session for the engine
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StackLayerFlags: u32 {
        /// The engine must leave this layer to the client
        const SKIP = 0x0001;
        /// The layer is a solid color fill
        const SOLID_FILL = 0x0002;
        /// The layer may use a cursor pipe
        const CURSOR = 0x0004;
        /// The buffer is in single buffer mode
        const SINGLE_BUFFER = 0x0008;
        /// A per-layer colour transform is set
        const COLOR_TRANSFORM = 0x0010;
        /// The buffer is rendered into while scanned out
        const FRONT_BUFFER = 0x0020;
        /// The content changed in this frame
        const UPDATING = 0x0040;
        /// The layer is compatible with the client's own composition
        const COMPATIBLE = 0x0080;
        /// The frame rate comes from the buffer metadata
        const HAS_METADATA_REFRESH_RATE = 0x0100;
        /// The buffer carries video
        const VIDEO = 0x0200;
        /// The buffer is secure
        const SECURE = 0x0400;
        /// The buffer is a secure display buffer
        const SECURE_DISPLAY = 0x0800;
        /// The content is HDR
        const HDR = 0x1000;
        /// The layer is a display decoration mask
        const MASK = 0x2000;
    }
}

bitflags::bitflags! {
    /// Stack wide flags, derived from the layers of one frame
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StackFlags: u32 {
        /// Some layer's geometry changed since the last commit
        const GEOMETRY_CHANGED = 0x0001;
        /// Some layer must be composed by the client
        const SKIP_PRESENT = 0x0002;
        /// A video layer is present
        const VIDEO_PRESENT = 0x0004;
        /// A secure layer is present
        const SECURE_PRESENT = 0x0008;
        /// An HDR layer is present
        const HDR_PRESENT = 0x0010;
        /// A cursor layer is present
        const CURSOR_PRESENT = 0x0020;
        /// A mask layer is present
        const MASK_PRESENT = 0x0040;
        /// A single buffer layer is present
        const SINGLE_BUFFER_PRESENT = 0x0080;
        /// A front buffer layer is present
        const FRONT_BUFFER_PRESENT = 0x0100;
        /// Some layer carries its frame rate in its metadata
        const USE_METADATA_REFRESH_RATE = 0x0200;
    }
}

bitflags::bitflags! {
    /// Requests the engine attaches to a layer after prepare
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RequestFlags: u32 {
        /// The client should render into a fresh client target
        const FLIP_BUFFER = 0x1;
        /// The client target should use the requested format and colour space
        const UPDATE_FORMAT = 0x2;
        /// The client should tone map this layer
        const TONE_MAP = 0x4;
    }
}

/// Engine request for one layer
#[derive(Debug, Clone, Default)]
pub struct LayerRequest {
    /// What is requested
    pub flags: RequestFlags,
    /// Requested format, with [`RequestFlags::UPDATE_FORMAT`]
    pub format: Option<Fourcc>,
    /// Requested colour space, with [`RequestFlags::UPDATE_FORMAT`]
    pub color_space: ColorSpace,
}

/// Buffer properties of a stack layer
#[derive(Debug, Clone, Default)]
pub struct StackBuffer {
    /// Identity of the allocation, 0 if the layer has no buffer
    pub id: u64,
    /// Pixel format
    pub format: Option<Fourcc>,
    /// Aligned width
    pub width: u32,
    /// Aligned height
    pub height: u32,
    /// Effective colour metadata
    pub color_metadata: ColorMetadata,
    /// Fence to wait on before reading the buffer
    pub acquire_fence: Option<SyncPoint>,
    /// Fence signalled when the engine is done reading the buffer
    pub release_fence: Option<SyncPoint>,
}

/// One layer as handed to the engine
#[derive(Debug, Clone, Default)]
pub struct StackLayer {
    /// The layer this entry was built from, `None` for the client target
    pub id: Option<LayerId>,
    /// The engine's decision, written by prepare
    pub composition: LayerComposition,
    /// Hints derived by the session
    pub flags: StackLayerFlags,
    /// Requests the engine attached during prepare
    pub request: LayerRequest,
    /// Buffer
    pub buffer: StackBuffer,
    /// Source crop
    pub src_rect: Rectangle<f32, BufferCoords>,
    /// Destination rectangle
    pub dst_rect: Rectangle<i32, Physical>,
    /// Damage of the current buffer
    pub dirty_regions: SmallVec<[Rectangle<i32, BufferCoords>; 4]>,
    /// Transform
    pub transform: Transform,
    /// Plane alpha
    pub plane_alpha: u8,
    /// Z-order
    pub z_order: u32,
    /// Solid fill color as 0xAARRGGBB
    pub solid_fill_color: u32,
    /// Brightness
    pub brightness: f32,
    /// Content frame rate
    pub frame_rate: u32,
    /// Geometry changes of the layer, as raw [`GeometryChanges`](crate::layer::GeometryChanges) bits
    pub geometry_changes: u32,
    /// Content updates, as raw [`LayerUpdates`](crate::layer::LayerUpdates) bits
    pub updates: u32,
    /// Per-layer color transform
    pub color_transform: Option<ColorMatrix>,
}

/// The capture buffer the engine wrote into during the last commit
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    /// Identity of the capture allocation
    pub handle_id: u64,
    /// Signalled once the writeback completed
    pub release_fence: Option<SyncPoint>,
}

/// One frame of layers as handed to the engine
///
/// The last entry of [`LayerStack::layers`] is always the client target.
#[derive(Debug, Clone, Default)]
pub struct LayerStack {
    /// Client layers in z-order, followed by the client target
    pub layers: Vec<StackLayer>,
    /// Stack wide flags
    pub flags: StackFlags,
    /// Union of all layer destination rectangles
    pub display_rect: Rectangle<i32, Physical>,
    /// Set by the engine on commit, signalled when the frame left the screen
    pub retire_fence: Option<SyncPoint>,
    /// Set by the engine on commit if a concurrent writeback was performed
    pub output_buffer: Option<OutputBuffer>,
    /// The stack must not be composed by the client, e.g. while dumping frames
    pub client_incompatible: bool,
}

impl LayerStack {
    /// The client target entry, if the stack was built
    pub fn client_target(&self) -> Option<&StackLayer> {
        self.layers.last().filter(|layer| layer.id.is_none())
    }

    /// The client target entry, mutably
    pub fn client_target_mut(&mut self) -> Option<&mut StackLayer> {
        self.layers.last_mut().filter(|layer| layer.id.is_none())
    }

    /// Looks up the entry built from `id`
    pub fn layer(&self, id: LayerId) -> Option<&StackLayer> {
        self.layers.iter().find(|layer| layer.id == Some(id))
    }
}

/// Power state of a display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PowerMode {
    /// Panel and pipeline are off
    #[default]
    Off,
    /// Fully on
    On,
    /// Low power, still updating
    Doze,
    /// Low power, not updating
    DozeSuspend,
}

/// Boundaries of a secure session
///
/// A trusted UI session runs `TuiPrepare -> TuiStart -> TuiEnd`, or aborts with
/// `TuiPrepare -> TuiUnprepare`. Secure display sessions run
/// `SecureDisplayStart -> SecureDisplayEnd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecureEvent {
    /// A secure display session starts
    SecureDisplayStart,
    /// The secure display session ends
    SecureDisplayEnd,
    /// A trusted UI session is about to start
    TuiPrepare,
    /// The trusted UI session takes over the display
    TuiStart,
    /// The trusted UI session hands the display back
    TuiEnd,
    /// The prepared trusted UI session is aborted
    TuiUnprepare,
}

/// Asynchronous events raised by the display driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisplayEvent {
    /// Nothing was committed for the idle timeout
    IdleTimeout,
    /// The panel stopped responding and needs a reset
    PanelDead,
    /// The hardware was reset and needs a full repaint
    PowerReset,
    /// The display entered its idle power collapse
    PostIdleTimeout,
}

/// Where in the pipeline a concurrent writeback taps the frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TapPoint {
    /// After layer mixing
    #[default]
    LayerMixer,
    /// After post processing
    Dspp,
    /// After demura correction
    Demura,
}

/// Parameters of a concurrent writeback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureConfig {
    /// Tap point
    pub tap_point: TapPoint,
    /// Region to capture, the whole display if empty
    pub roi: Rectangle<i32, Physical>,
}

/// A display mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DisplayConfig {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Vsync period in nanoseconds
    pub vsync_period_ns: u32,
    /// Modes of the same group can be switched to seamlessly
    pub config_group: i32,
}

impl DisplayConfig {
    /// Refresh rate in frames per second
    pub fn refresh_rate(&self) -> u32 {
        if self.vsync_period_ns == 0 {
            0
        } else {
            (1_000_000_000 + self.vsync_period_ns / 2) / self.vsync_period_ns
        }
    }

    /// Vsync period
    pub fn vsync_period(&self) -> Duration {
        Duration::from_nanos(u64::from(self.vsync_period_ns))
    }
}

/// The hardware composition engine of one display
///
/// Colour profile enumeration is part of the engine through [`ColorProfileSource`].
pub trait CompositionEngine: ColorProfileSource + Send {
    /// Decides per layer whether it can be composed in hardware
    ///
    /// Writes [`StackLayer::composition`] and [`StackLayer::request`] for every layer.
    fn prepare(&mut self, stack: &mut LayerStack) -> Result<PrepareStatus, EngineError>;

    /// Validates the stack and commits it right away if no client composition is needed
    ///
    /// Returns [`PrepareStatus::Done`] if the frame was committed, [`PrepareStatus::NeedsCommit`]
    /// if it was only validated. With `validate_only` the frame is never committed.
    fn commit_or_prepare(
        &mut self,
        stack: &mut LayerStack,
        validate_only: bool,
    ) -> Result<PrepareStatus, EngineError>;

    /// Submits a validated stack to the display
    ///
    /// Writes release fences, the retire fence and the writeback output buffer.
    fn commit(&mut self, stack: &mut LayerStack) -> Result<(), EngineError>;

    /// Drops the current frame and releases every buffer the engine holds
    fn flush(&mut self, stack: &mut LayerStack) -> Result<(), EngineError>;

    /// Whether the last prepare is still valid
    fn is_validated(&self) -> bool;

    /// Supported display modes
    fn configs(&self) -> Vec<DisplayConfig>;

    /// Index of the mode currently scanned out
    fn active_config(&self) -> usize;

    /// Switches to another display mode
    fn set_active_config(&mut self, index: usize) -> Result<(), EngineError>;

    /// Whether switching modes is allowed right now
    fn is_mode_switch_allowed(&self, _index: usize) -> bool {
        true
    }

    /// Changes the power state, returning a fence signalled once the transition completed
    fn set_display_state(&mut self, mode: PowerMode, teardown: bool) -> Result<Option<SyncPoint>, EngineError>;

    /// Enables or disables vsync events
    fn set_vsync_enabled(&mut self, enabled: bool) -> Result<(), EngineError>;

    /// Requests a concurrent writeback of the next committed frame into `buffer`
    fn capture_concurrent_writeback(
        &mut self,
        buffer: BufferRef<'_>,
        acquire_fence: Option<SyncPoint>,
        config: &CaptureConfig,
    ) -> Result<(), EngineError>;

    /// Whether the writeback block can write `format`
    fn is_writeback_format_supported(&self, format: Fourcc) -> bool;

    /// Tears down a pending concurrent writeback, returns `false` if there was none to tear down
    fn handle_cwb_teardown(&mut self) -> bool {
        false
    }

    /// Starts a secure session transition, returns whether a refresh is needed to complete it
    fn handle_secure_event(&mut self, event: SecureEvent) -> Result<bool, EngineError>;

    /// Completes a secure session transition after the frame that required it was committed
    fn post_handle_secure_event(&mut self, _event: SecureEvent) -> Result<(), EngineError> {
        Ok(())
    }

    /// Called before a layer is destroyed
    ///
    /// Blocks until no in-flight asynchronous commit references layers anymore.
    fn destroy_layer(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Whether the panel is a command mode panel
    fn is_command_mode(&self) -> bool {
        false
    }
}
