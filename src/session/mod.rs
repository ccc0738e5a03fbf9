//! Per-display composition sessions
//!
//! A [`CompositionSession`] drives one display through its frames. The client edits
//! layers, then asks the session to [`validate`](CompositionSession::validate) the frame:
//! the session assembles a [`LayerStack`], lets the engine decide per layer whether it is
//! composed by the client or in hardware, and reports the layers whose composition
//! changed. The client accepts the changes, renders the client composed layers into the
//! client target, and [`present`](CompositionSession::present)s the frame.
//!
//! ```text
//! Idle -> Validating -> (Validated | NeedsCommit) -> Committing -> PostCommit -> Idle
//! ```
//!
//! Engine failures are classified centrally. A shutdown of the display makes every
//! later call a successful no-op, a permission failure falls back to client composition
//! and asks for another frame, anything else is reported to the caller after a refresh
//! was requested.
//!
//! Sessions also own the display's concurrent writeback requests (see
//! [`capture`](crate::capture)), its colour modes, refresh rate changes and secure
//! session transitions.

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use indexmap::IndexMap;
use tracing::{debug, info, info_span, instrument, trace, warn, Span};

use crate::{
    buffer::{BufferMetadataProvider, BufferRef, Fourcc},
    capture::{
        dump::{dump_directory, DumpBufferAllocator, FrameDump},
        CaptureClient, CaptureError, CaptureHandle, CaptureManager, CaptureStatus, Readback, StackOutput,
    },
    color::{ColorError, ColorMatrix, ColorMode, ColorModeManager, Dataspace, RenderIntent},
    config::SessionConfig,
    context::CompositorContext,
    engine::{
        CaptureConfig, CompositionEngine, DisplayConfig, DisplayEvent, EngineError, LayerRequest, LayerStack,
        PowerMode, PrepareStatus, RequestFlags, SecureEvent, StackFlags, StackLayerFlags,
    },
    layer::{Composition, GeometryChanges, Layer, LayerError},
    notify::{Notification, NotificationSink},
    sync::SyncPoint,
    utils::{Buffer as BufferCoords, Clock, LayerId, Monotonic, Rectangle},
};

mod power;
mod secure;
mod stack;
mod timeline;

pub use self::timeline::{VsyncPeriodChangeConstraints, VsyncPeriodChangeTimeline};
use self::{
    secure::SecureState,
    timeline::{PendingRateChange, TransientPeriods},
};

/// Errors of session operations
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// An argument is out of range
    #[error("Invalid parameter: {0}")]
    BadParameter(&'static str),
    /// No layer with this id exists on the display
    #[error("Unknown layer {0}")]
    BadLayer(LayerId),
    /// The display config does not exist or cannot be switched to
    #[error("Invalid display config {0}")]
    BadConfig(usize),
    /// The display cannot do this in its current state
    #[error("The display cannot perform this operation")]
    BadDisplay,
    /// The frame has to be validated first
    #[error("The frame was not validated")]
    NotValidated,
    /// A seamless switch to the config was required but is impossible
    #[error("The config cannot be switched to seamlessly")]
    SeamlessNotAllowed,
    /// The operation is not supported, or not right now
    #[error("Operation not supported")]
    Unsupported,
    /// Hardware resources are exhausted
    #[error("Hardware resources are exhausted")]
    NoResources,
    /// The secure event does not follow the recorded one
    #[error("Secure event {to:?} cannot follow {from:?}")]
    InvalidTransition {
        /// The recorded event
        from: Option<SecureEvent>,
        /// The rejected event
        to: SecureEvent,
    },
    /// Another secure transition did not complete yet
    #[error("Secure transition {0:?} is still in flight")]
    TransitionInFlight(SecureEvent),
    /// A layer property was rejected
    #[error(transparent)]
    Layer(#[from] LayerError),
    /// A colour operation failed
    #[error(transparent)]
    Color(#[from] ColorError),
    /// A capture operation failed
    #[error(transparent)]
    Capture(#[from] CaptureError),
    /// The engine failed
    #[error("The composition engine failed")]
    Engine(#[source] EngineError),
}

/// Outcome of a validate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ValidateResult {
    /// Number of layers whose composition changed
    pub changed_types: usize,
    /// Number of layer requests
    pub requests: usize,
    /// Whether the client has to look at changes or requests before presenting
    pub has_changes: bool,
}

/// Outcome of [`CompositionSession::commit_or_validate`]
#[derive(Debug, Clone, Default)]
pub struct CommitOrValidate {
    /// The validate part
    pub validation: ValidateResult,
    /// Whether the frame was committed already, no present is needed then
    pub committed: bool,
    /// Retire fence of the committed frame
    pub retire_fence: Option<SyncPoint>,
}

/// What the engine asks the client to do with a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerRequestKind {
    /// Clear the area of the layer in the client target, the layer is composed in hardware
    ClearClientTarget,
}

bitflags::bitflags! {
    /// Display wide requests to the client
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DisplayRequests: u32 {
        /// Render into a new client target buffer
        const FLIP_CLIENT_TARGET = 0x1;
    }
}

/// Format and dataspace the engine wants the client target in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientTargetProperty {
    /// Pixel format
    pub format: Fourcc,
    /// Dataspace
    pub dataspace: Dataspace,
}

/// The composition state of one display
pub struct CompositionSession<E: CompositionEngine> {
    span: Span,
    config: SessionConfig,
    context: Arc<CompositorContext>,
    engine: E,
    provider: Arc<dyn BufferMetadataProvider>,
    sink: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,

    layers: IndexMap<LayerId, Layer>,
    client_target: Layer,
    stack: LayerStack,
    color: ColorModeManager,

    capture: CaptureHandle,
    dump_allocator: Option<Box<dyn DumpBufferAllocator>>,
    frame_dump: Option<FrameDump>,
    frame_capture_status: Option<CaptureStatus>,

    geometry_changes: GeometryChanges,
    geometry_changes_on_doze_suspend: GeometryChanges,
    layer_changes: IndexMap<LayerId, Composition>,
    layer_requests: IndexMap<LayerId, LayerRequestKind>,
    has_client_composition: bool,
    validated: bool,
    layer_stack_invalid: bool,
    shutdown_pending: bool,
    flush: bool,
    flush_on_error: bool,
    first_commit_done: bool,
    skip_commit: bool,
    idle: bool,

    power_mode: PowerMode,
    power_release_fence: Option<SyncPoint>,
    retire_fence: Option<SyncPoint>,
    vsync_enabled: bool,

    configs: Vec<DisplayConfig>,
    active_config: usize,
    current_refresh_rate: u32,
    pending_config: Option<usize>,
    pending_first_commit_config: Option<usize>,
    rate_change: Option<PendingRateChange>,
    transient_periods: Mutex<TransientPeriods>,

    secure: SecureState,

    // last, so the capture thread outlives everything holding a handle
    _capture_thread: CaptureManager,
}

impl<E: CompositionEngine> fmt::Debug for CompositionSession<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositionSession")
            .field("display", &self.config.display_id)
            .field("layers", &self.layers.len())
            .field("power_mode", &self.power_mode)
            .field("validated", &self.validated)
            .field("shutdown_pending", &self.shutdown_pending)
            .field("active_config", &self.active_config)
            .field("secure", &self.secure)
            .finish_non_exhaustive()
    }
}

fn submit_writeback<E: CompositionEngine>(
    engine: &mut E,
    capture: &CaptureHandle,
    buffer: BufferRef<'_>,
    format: Fourcc,
    acquire_fence: Option<SyncPoint>,
    config: &CaptureConfig,
    client: CaptureClient,
) -> Result<(), CaptureError> {
    if !engine.is_writeback_format_supported(format) {
        warn!(?format, "Format not supported by writeback");
        return Err(CaptureError::BadParameter("format not supported by writeback"));
    }
    capture.request(client, buffer.id)?;
    if let Err(err) = engine.capture_concurrent_writeback(buffer, acquire_fence, config) {
        warn!(?err, ?client, handle_id = buffer.id, "Engine rejected the writeback");
        capture.cancel(buffer.id);
        return Err(match err {
            EngineError::Parameters => CaptureError::BadParameter("writeback parameters rejected"),
            _ => CaptureError::Unsupported,
        });
    }
    Ok(())
}

impl<E: CompositionEngine> CompositionSession<E> {
    /// Creates the session of a display driven by `engine`
    ///
    /// Spawns the display's capture thread and reads the display modes and colour
    /// profiles of the engine.
    pub fn new(
        engine: E,
        context: Arc<CompositorContext>,
        provider: Arc<dyn BufferMetadataProvider>,
        sink: Arc<dyn NotificationSink>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let span = info_span!("hwc_session", display = %config.display_id);
        let _guard = span.enter();

        let configs = engine.configs();
        let active_config = engine.active_config();
        let current_refresh_rate = configs
            .get(active_config)
            .ok_or(SessionError::BadConfig(active_config))?
            .refresh_rate();
        let color = ColorModeManager::populate_with_tonemap(&engine, config.allow_sde_tonemap);
        let capture_thread = CaptureManager::spawn(config.display_id, Some(sink.clone()))?;

        let client_target = Layer::new(context.next_layer_id());
        info!(
            kind = config.display_kind.as_str(),
            configs = configs.len(),
            active_config,
            color_modes = color.mode_count(),
            "Display session created"
        );
        drop(_guard);

        Ok(CompositionSession {
            span,
            context,
            engine,
            provider,
            sink,
            clock: Arc::new(Monotonic),
            layers: IndexMap::new(),
            client_target,
            stack: LayerStack::default(),
            color,
            capture: capture_thread.handle(),
            dump_allocator: None,
            frame_dump: None,
            frame_capture_status: None,
            geometry_changes: GeometryChanges::empty(),
            geometry_changes_on_doze_suspend: GeometryChanges::empty(),
            layer_changes: IndexMap::new(),
            layer_requests: IndexMap::new(),
            has_client_composition: false,
            validated: false,
            layer_stack_invalid: true,
            shutdown_pending: false,
            flush: false,
            flush_on_error: false,
            first_commit_done: false,
            skip_commit: false,
            idle: false,
            power_mode: PowerMode::Off,
            power_release_fence: None,
            retire_fence: None,
            vsync_enabled: false,
            configs,
            active_config,
            current_refresh_rate,
            pending_config: None,
            pending_first_commit_config: None,
            rate_change: None,
            transient_periods: Mutex::new(TransientPeriods::default()),
            secure: SecureState::default(),
            config,
            _capture_thread: capture_thread,
        })
    }

    /// Uses `clock` instead of the monotonic clock for refresh rate timelines
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Enables frame dumps, with buffers allocated through `allocator`
    pub fn with_dump_allocator(mut self, allocator: Box<dyn DumpBufferAllocator>) -> Self {
        self.dump_allocator = Some(allocator);
        self
    }

    /// Configuration of this session
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The engine driving the display
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// A handle to the display's capture thread
    ///
    /// The engine's completion path reports finished writebacks through
    /// [`CaptureHandle::notify_done`].
    pub fn capture_handle(&self) -> CaptureHandle {
        self.capture.clone()
    }

    /// Whether the display was torn down, every call is a no-op from then on
    pub fn is_shutdown(&self) -> bool {
        self.shutdown_pending
    }

    fn enter_shutdown(&mut self) {
        if !self.shutdown_pending {
            warn!("Display shut down, draining");
        }
        self.shutdown_pending = true;
    }

    fn notify(&self, notification: Notification) {
        trace!(?notification, "Notifying client");
        if let Err(err) = self.sink.notify(self.config.display_id, notification) {
            debug!(?err, "Notification dropped");
        }
    }

    fn request_refresh(&self) {
        self.notify(Notification::Refresh);
    }

    /// Adds a new layer to the display
    pub fn create_layer(&mut self) -> LayerId {
        let id = self.context.next_layer_id();
        let mut layer = Layer::new(id);
        layer.set_sdr_dimming_disabled(self.config.disable_sdr_dimming);
        self.layers.insert(id, layer);
        self.geometry_changes |= GeometryChanges::ADDED;
        self.layer_stack_invalid = true;
        self.validated = false;
        debug!(parent: &self.span, layer = %id, "Layer created");
        id
    }

    /// Removes a layer from the display
    ///
    /// Waits until the engine no longer references any layer.
    pub fn destroy_layer(&mut self, id: LayerId) -> Result<(), SessionError> {
        if self.shutdown_pending {
            return Ok(());
        }
        if !self.layers.contains_key(&id) {
            return Err(SessionError::BadLayer(id));
        }
        if let Err(err) = self.engine.destroy_layer() {
            warn!(parent: &self.span, layer = %id, ?err, "Engine failed to release the layer");
        }
        self.layers.shift_remove(&id);
        self.layer_changes.shift_remove(&id);
        self.layer_requests.shift_remove(&id);
        self.geometry_changes |= GeometryChanges::REMOVED;
        self.layer_stack_invalid = true;
        self.validated = false;
        debug!(parent: &self.span, layer = %id, "Layer destroyed");
        Ok(())
    }

    /// Looks up a layer
    pub fn layer(&self, id: LayerId) -> Option<&Layer> {
        self.layers.get(&id)
    }

    /// Looks up a layer for editing, the current frame has to be validated again afterwards
    pub fn layer_mut(&mut self, id: LayerId) -> Result<&mut Layer, SessionError> {
        let layer = self.layers.get_mut(&id).ok_or(SessionError::BadLayer(id))?;
        self.validated = false;
        Ok(layer)
    }

    /// Ids of all layers, bottom to top
    pub fn layers(&self) -> Vec<LayerId> {
        self.layer_order()
    }

    /// Assigns a buffer to a layer, reading its metadata through the session's provider
    pub fn set_layer_buffer(
        &mut self,
        id: LayerId,
        buffer: Option<BufferRef<'_>>,
        acquire_fence: SyncPoint,
    ) -> Result<(), SessionError> {
        let provider = self.provider.clone();
        self.layer_mut(id)?.set_buffer(buffer, acquire_fence, &*provider)?;
        Ok(())
    }

    /// Sets the dataspace of a layer
    pub fn set_layer_dataspace(&mut self, id: LayerId, dataspace: Dataspace) -> Result<(), SessionError> {
        let provider = self.provider.clone();
        self.layer_mut(id)?.set_dataspace(dataspace, &*provider);
        Ok(())
    }

    /// Moves a layer in the stack
    pub fn set_layer_z_order(&mut self, id: LayerId, z: u32) -> Result<(), SessionError> {
        self.layer_mut(id)?.set_z_order(z);
        self.layer_stack_invalid = true;
        Ok(())
    }

    /// Whether the content of a layer changed in the last validated frame
    pub fn is_layer_updating(&self, id: LayerId) -> Result<bool, SessionError> {
        if !self.layers.contains_key(&id) {
            return Err(SessionError::BadLayer(id));
        }
        Ok(self
            .stack
            .layer(id)
            .is_some_and(|entry| entry.flags.contains(StackLayerFlags::UPDATING)))
    }

    /// Sets the buffer the client composed its layers into
    ///
    /// Without a buffer the previous one is reused.
    pub fn set_client_target(
        &mut self,
        buffer: Option<BufferRef<'_>>,
        acquire_fence: SyncPoint,
        dataspace: Dataspace,
        damage: &[Rectangle<i32, BufferCoords>],
    ) -> Result<(), SessionError> {
        if self.shutdown_pending {
            return Ok(());
        }
        let Some(buffer) = buffer else {
            trace!(parent: &self.span, "Reusing the cached client target");
            return Ok(());
        };

        let throttle = self.context.throttling_refresh_rate();
        let rate = match throttle {
            0 => self.current_refresh_rate,
            throttle => self.current_refresh_rate.min(throttle),
        };
        self.client_target.set_frame_rate(rate);
        self.client_target.set_dataspace(dataspace, &*self.provider);
        self.client_target.set_surface_damage(damage);
        self.client_target
            .set_buffer(Some(buffer), acquire_fence, &*self.provider)?;
        self.refresh_stack_client_target();
        Ok(())
    }

    /// The client target layer
    pub fn client_target(&self) -> &Layer {
        &self.client_target
    }

    fn reset_validate_state(&mut self) {
        self.layer_changes.clear();
        self.layer_requests.clear();
        self.has_client_composition = false;
        self.validated = false;
        self.idle = false;
    }

    fn prepare_frame(&mut self) {
        self.update_refresh_rate();
        self.update_active_config();
        self.build_layer_stack();
        let hdr = self.stack.flags.contains(StackFlags::HDR_PRESENT);
        if let Err(err) = self.color.apply_current(&mut self.engine, hdr) {
            warn!(?err, hdr, "Failed to apply the colour mode");
        }
    }

    /// Decides the composition of every layer of the next frame
    ///
    /// Returns how many layers changed composition and how many carry requests, see
    /// [`changed_composition_types`](Self::changed_composition_types) and
    /// [`display_requests`](Self::display_requests).
    #[instrument(level = "debug", skip_all, parent = &self.span)]
    #[profiling::function]
    pub fn validate(&mut self) -> Result<ValidateResult, SessionError> {
        self.reset_validate_state();
        if self.shutdown_pending {
            return Ok(ValidateResult::default());
        }

        self.process_active_config_change();
        self.prepare_frame();
        if self.secure.is_paused() {
            debug!("Display paused by a secure session");
            self.mark_layers_for_client_composition();
            self.skip_commit = true;
            return Ok(self.post_prepare());
        }
        if self.can_skip_validate() {
            self.validated = true;
            return Ok(self.validate_result());
        }

        match self.engine.prepare(&mut self.stack) {
            Ok(status) => {
                trace!(?status, "Prepared");
                self.geometry_changes_on_doze_suspend = GeometryChanges::empty();
            }
            Err(err) => self.handle_prepare_error(err)?,
        }
        Ok(self.post_prepare())
    }

    fn handle_prepare_error(&mut self, err: EngineError) -> Result<(), SessionError> {
        match err {
            EngineError::Shutdown => {
                self.enter_shutdown();
                Ok(())
            }
            EngineError::Permission => {
                info!("Prepare not permitted, falling back to client composition");
                self.wait_on_previous_fence();
                self.mark_layers_for_client_composition();
                let mut changes = self.geometry_changes;
                for layer in self.layers.values() {
                    changes |= layer.geometry_changes();
                }
                self.geometry_changes_on_doze_suspend |= changes;
                self.request_refresh();
                Ok(())
            }
            err => {
                // other displays may hold the hardware this one needs, give them a frame
                warn!(?err, "Prepare failed");
                self.request_refresh();
                Err(match err {
                    EngineError::Resources => SessionError::NoResources,
                    err => SessionError::Engine(err),
                })
            }
        }
    }

    /// Takes over the engine's decision as the requested composition of every changed layer
    pub fn accept_changes(&mut self) -> Result<(), SessionError> {
        if !self.validated {
            return Err(SessionError::NotValidated);
        }
        for id in self.layer_changes.keys() {
            if let Some(layer) = self.layers.get_mut(id) {
                layer.accept_device_composition();
            }
        }
        self.layer_changes.clear();
        Ok(())
    }

    /// Layers whose composition differs from what the client requested
    pub fn changed_composition_types(&self) -> Result<Vec<(LayerId, Composition)>, SessionError> {
        if self.layers.is_empty() {
            return Ok(Vec::new());
        }
        if !self.validated {
            return Err(SessionError::NotValidated);
        }
        Ok(self.layer_changes.iter().map(|(id, kind)| (*id, *kind)).collect())
    }

    /// Requests of the last validate
    pub fn display_requests(&self) -> Result<(DisplayRequests, Vec<(LayerId, LayerRequestKind)>), SessionError> {
        if !self.validated {
            return Err(SessionError::NotValidated);
        }
        let mut flags = DisplayRequests::empty();
        if self
            .stack
            .client_target()
            .is_some_and(|target| target.request.flags.contains(RequestFlags::FLIP_BUFFER))
        {
            flags |= DisplayRequests::FLIP_CLIENT_TARGET;
        }
        let layers = self.layer_requests.iter().map(|(id, kind)| (*id, *kind)).collect();
        Ok((flags, layers))
    }

    /// Format and dataspace the engine asked the client target to be rendered in
    pub fn client_target_property(&self) -> Result<Option<ClientTargetProperty>, SessionError> {
        let Some(request) = self.stack.client_target().map(|target| &target.request) else {
            return Ok(None);
        };
        if !request.flags.contains(RequestFlags::UPDATE_FORMAT) {
            return Ok(None);
        }
        let format = request
            .format
            .ok_or(SessionError::BadParameter("no client target format requested"))?;
        let dataspace = request.color_space.to_dataspace()?;
        Ok(Some(ClientTargetProperty { format, dataspace }))
    }

    /// Commits the validated frame
    ///
    /// Returns the retire fence of the frame.
    #[instrument(level = "debug", skip_all, parent = &self.span)]
    #[profiling::function]
    pub fn present(&mut self) -> Result<Option<SyncPoint>, SessionError> {
        if self.shutdown_pending {
            return Ok(None);
        }
        let result = self.commit_layer_stack();
        if let Err(SessionError::NotValidated) = result {
            return Err(SessionError::NotValidated);
        }
        self.post_commit();
        result.map(|()| self.retire_fence.clone())
    }

    fn commit_layer_stack(&mut self) -> Result<(), SessionError> {
        if self.flush {
            debug!("Flush pending, not committing");
            return Ok(());
        }
        if self.shutdown_pending || self.layers.is_empty() {
            return Ok(());
        }
        if !self.validated {
            debug!("Commit without validate");
            return Err(SessionError::NotValidated);
        }
        if self.skip_commit {
            return Ok(());
        }

        match self.engine.commit(&mut self.stack) {
            Ok(()) => {
                // once something reached the screen a failed commit must release it
                self.flush_on_error = true;
                self.first_commit_done = true;
                Ok(())
            }
            Err(EngineError::Shutdown) => {
                self.enter_shutdown();
                Ok(())
            }
            Err(EngineError::NotValidated) => Err(SessionError::NotValidated),
            Err(EngineError::Permission) => {
                info!("Commit not permitted");
                Err(SessionError::Engine(EngineError::Permission))
            }
            Err(err) => {
                warn!(?err, "Commit failed, flushing");
                self.flush = true;
                Err(SessionError::Engine(err))
            }
        }
    }

    /// Validates and, if the engine can do without client composition, commits in one go
    #[instrument(level = "debug", skip_all, parent = &self.span, fields(validate_only = validate_only))]
    pub fn commit_or_validate(&mut self, validate_only: bool) -> Result<CommitOrValidate, SessionError> {
        self.reset_validate_state();
        if self.shutdown_pending {
            return Ok(CommitOrValidate::default());
        }

        self.process_active_config_change();
        self.prepare_frame();

        let status = match self.engine.commit_or_prepare(&mut self.stack, validate_only) {
            Ok(status) => {
                self.geometry_changes_on_doze_suspend = GeometryChanges::empty();
                status
            }
            Err(err) => {
                self.handle_prepare_error(err)?;
                PrepareStatus::NeedsCommit
            }
        };

        let committed = status == PrepareStatus::Done && !self.shutdown_pending;
        if committed {
            self.flush_on_error = true;
            self.first_commit_done = true;
            self.post_commit();
        }
        let validation = self.post_prepare();
        Ok(CommitOrValidate {
            validation,
            committed,
            retire_fence: if committed { self.retire_fence.clone() } else { None },
        })
    }

    fn post_commit(&mut self) {
        if self.flush && self.flush_on_error {
            if let Err(err) = self.engine.flush(&mut self.stack) {
                warn!(?err, "Flush failed");
            }
        }
        self.retrieve_fences();

        for layer in self.layers.values_mut() {
            layer.reset_geometry_changes();
            layer.reset_per_frame_flags();
        }
        self.client_target.reset_geometry_changes();
        self.client_target.reset_per_frame_flags();
        for entry in &mut self.stack.layers {
            entry.request = LayerRequest::default();
            entry.buffer.acquire_fence = None;
        }
        self.stack.flags.remove(StackFlags::GEOMETRY_CHANGED);
        self.geometry_changes = GeometryChanges::empty();
        self.flush = false;
        self.skip_commit = false;

        if self.secure.on_commit() {
            info!("Display paused for a secure session");
        }
        if let Some(index) = self.pending_first_commit_config.take() {
            debug!(index, "Applying the config deferred to the first commit");
            if let Err(err) = self.set_active_config(index) {
                warn!(?err, index, "Failed to apply the deferred config");
            }
        }

        self.handle_frame_output();
    }

    fn retrieve_fences(&mut self) {
        let flushed = self.flush;
        for entry in &mut self.stack.layers {
            let Some(id) = entry.id else {
                continue;
            };
            let Some(layer) = self.layers.get_mut(&id) else {
                continue;
            };
            if flushed {
                layer.push_release_fence(None);
            } else if !self.config.zero_swap_interval && !entry.flags.contains(StackLayerFlags::SINGLE_BUFFER) {
                layer.push_release_fence(entry.buffer.release_fence.take());
            }
        }
        self.retire_fence = if self.config.zero_swap_interval {
            None
        } else {
            self.stack.retire_fence.take()
        };
    }

    /// Hands out the release fences of the last committed frame
    pub fn release_fences(&mut self) -> Vec<(LayerId, SyncPoint)> {
        self.layers
            .iter_mut()
            .filter_map(|(id, layer)| layer.take_release_fence().map(|fence| (*id, fence)))
            .collect()
    }

    /// Retire fence of the last committed frame
    pub fn retire_fence(&self) -> Option<SyncPoint> {
        self.retire_fence.clone()
    }

    /// Modes of the display
    pub fn configs(&self) -> &[DisplayConfig] {
        &self.configs
    }

    /// The active config, or the one about to become active
    pub fn active_config(&self) -> usize {
        self.pending_config.unwrap_or(self.active_config)
    }

    fn check_config(&self, index: usize) -> Result<&DisplayConfig, SessionError> {
        let config = self.configs.get(index).ok_or(SessionError::BadConfig(index))?;
        if !self.engine.is_mode_switch_allowed(index) {
            warn!(parent: &self.span, index, "Mode switch not allowed");
            return Err(SessionError::BadConfig(index));
        }
        Ok(config)
    }

    /// Switches the display mode with the next frame
    ///
    /// Before the first frame reached the screen the switch is deferred until it did.
    pub fn set_active_config(&mut self, index: usize) -> Result<(), SessionError> {
        if self.shutdown_pending {
            return Ok(());
        }
        if self.configs.get(index).is_some() && index == self.active_config() {
            return Ok(());
        }
        self.check_config(index)?;

        if !self.first_commit_done {
            info!(parent: &self.span, index, "Deferring config change to the first commit");
            self.pending_first_commit_config = Some(index);
            return Ok(());
        }
        self.pending_first_commit_config = None;
        self.rate_change = None;
        self.transient_periods
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.pending_config = Some(index);
        self.validated = false;
        self.request_refresh();
        Ok(())
    }

    fn update_active_config(&mut self) {
        let Some(index) = self.pending_config.take() else {
            return;
        };
        if let Err(err) = self.submit_display_config(index) {
            warn!(?err, index, "Dropping config change");
        }
    }

    fn submit_display_config(&mut self, index: usize) -> Result<(), SessionError> {
        let config = *self.configs.get(index).ok_or(SessionError::BadConfig(index))?;
        if let Err(err) = self.engine.set_active_config(index) {
            warn!(?err, from = self.active_config, to = index, "Engine rejected the config");
            return Err(SessionError::BadConfig(index));
        }
        let previous = std::mem::replace(&mut self.active_config, index);
        self.current_refresh_rate = config.refresh_rate();
        info!(previous, index, refresh_rate = self.current_refresh_rate, "Active config changed");
        Ok(())
    }

    /// Switches the display mode at a given time
    ///
    /// Returns when the client should present the frame that triggers the switch, and
    /// when the new vsync period is in effect.
    #[instrument(level = "debug", skip_all, parent = &self.span, fields(index = index))]
    pub fn set_active_config_with_constraints(
        &mut self,
        index: usize,
        constraints: VsyncPeriodChangeConstraints,
    ) -> Result<VsyncPeriodChangeTimeline, SessionError> {
        if self.shutdown_pending {
            return Ok(VsyncPeriodChangeTimeline::default());
        }
        let config = *self.check_config(index)?;
        if constraints.seamless_required
            && self
                .configs
                .get(self.active_config)
                .map_or(true, |active| active.config_group != config.config_group)
        {
            warn!("Seamless switch not possible");
            return Err(SessionError::SeamlessNotAllowed);
        }

        if !self.first_commit_done {
            info!("Deferring config change to the first commit");
            self.pending_first_commit_config = Some(index);
            return Ok(VsyncPeriodChangeTimeline::default());
        }
        self.pending_first_commit_config = None;

        let period = nanos(self.vsync_period());
        let (refresh_time, applied_time) = timeline::estimate(
            self.clock.now(),
            period,
            constraints.desired_time,
            self.config.vsyncs_to_apply_rate_change,
        );
        self.rate_change = Some(PendingRateChange {
            config: index,
            refresh_time,
            applied_time,
        });
        debug!(?refresh_time, ?applied_time, "Config change scheduled");
        Ok(VsyncPeriodChangeTimeline {
            new_vsync_applied_time: applied_time,
            refresh_required: true,
            refresh_time,
        })
    }

    /// Submits a scheduled config change once its refresh time has come
    ///
    /// Called at the start of every validate. If the change lands later than promised,
    /// the client is told through [`Notification::VsyncPeriodTimingChanged`].
    pub fn process_active_config_change(&mut self) {
        let now = self.clock.now();
        let Some(pending) = self.rate_change.filter(|pending| pending.is_ready(now)) else {
            return;
        };
        self.rate_change = None;

        let period = self.active_vsync_period();
        if self.submit_display_config(pending.config).is_err() {
            return;
        }

        let (refresh_time, applied_time) = timeline::estimate(
            now,
            nanos(period),
            pending.refresh_time,
            self.config.vsyncs_to_apply_rate_change,
        );
        self.transient_periods
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(period, applied_time);

        if applied_time != pending.applied_time {
            debug!(promised = ?pending.applied_time, ?applied_time, "Config change timeline moved");
            self.notify(Notification::VsyncPeriodTimingChanged {
                timeline: VsyncPeriodChangeTimeline {
                    new_vsync_applied_time: applied_time,
                    refresh_required: false,
                    refresh_time,
                },
            });
        }
    }

    fn active_vsync_period(&self) -> Duration {
        self.configs
            .get(self.active_config)
            .map_or(Duration::ZERO, DisplayConfig::vsync_period)
    }

    /// The vsync period in effect right now
    ///
    /// While a config change settles this is still the old period.
    pub fn vsync_period(&self) -> Duration {
        let now = self.clock.now();
        self.transient_periods
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .current(now)
            .unwrap_or_else(|| self.active_vsync_period())
    }

    /// Starts a secure session transition
    ///
    /// Returns whether another frame is needed to complete it, a refresh is requested then.
    #[instrument(level = "debug", skip_all, parent = &self.span, fields(?event))]
    pub fn handle_secure_event(&mut self, event: SecureEvent) -> Result<bool, SessionError> {
        if self.shutdown_pending {
            return Ok(false);
        }
        self.secure.check(event)?;

        let needs_refresh = self.engine.handle_secure_event(event).map_err(|err| {
            warn!(?err, "Engine rejected the secure event");
            SessionError::Engine(err)
        })?;
        if event == SecureEvent::TuiEnd {
            self.color.reapply_mode();
        }
        self.secure.record(event, needs_refresh);
        info!(needs_refresh, "Secure event handled");

        if needs_refresh {
            self.validated = false;
            self.request_refresh();
        }
        Ok(needs_refresh)
    }

    /// Completes a secure session transition after the frame it needed was presented
    pub fn post_handle_secure_event(&mut self, event: SecureEvent) -> Result<(), SessionError> {
        if self.shutdown_pending {
            return Ok(());
        }
        self.engine
            .post_handle_secure_event(event)
            .map_err(SessionError::Engine)?;
        self.secure.complete(event);
        Ok(())
    }

    /// The recorded secure event, `None` outside of secure sessions
    pub fn secure_event(&self) -> Option<SecureEvent> {
        self.secure.event()
    }

    /// Whether a secure session took the display over
    pub fn is_paused(&self) -> bool {
        self.secure.is_paused()
    }

    /// Requests a writeback of the next frame into `buffer` on behalf of `client`
    #[instrument(level = "debug", skip_all, parent = &self.span, fields(?client, handle_id = buffer.id))]
    pub fn set_readback_buffer(
        &mut self,
        buffer: BufferRef<'_>,
        acquire_fence: Option<SyncPoint>,
        config: CaptureConfig,
        client: CaptureClient,
    ) -> Result<(), SessionError> {
        if self.shutdown_pending {
            return Ok(());
        }
        if matches!(self.power_mode, PowerMode::Off | PowerMode::DozeSuspend) {
            return Err(CaptureError::BadDisplay.into());
        }
        if self.secure.is_active() {
            return Err(CaptureError::Unsupported.into());
        }
        let format = self.provider.format(buffer).map_err(|err| {
            warn!(?err, "Failed to read the readback buffer format");
            CaptureError::BadParameter("unknown buffer format")
        })?;

        submit_writeback(
            &mut self.engine,
            &self.capture,
            buffer,
            format,
            acquire_fence,
            &config,
            client,
        )?;
        Ok(())
    }

    /// Retrieves the result of the last writeback requested by `client`
    pub fn readback_fence(&self, client: CaptureClient) -> Result<Readback, SessionError> {
        let output = self.stack.output_buffer.as_ref().map(|output| StackOutput {
            handle_id: output.handle_id,
            fence: output.release_fence.clone(),
        });
        Ok(self.capture.poll(client, output)?)
    }

    /// Outcome of the last colour tooling capture
    pub fn frame_capture_status(&self) -> Option<CaptureStatus> {
        self.frame_capture_status
    }

    fn cwb_resolution(&self, config: &CaptureConfig) -> Option<(u32, u32)> {
        if !config.roi.is_empty() {
            return Some((config.roi.size.w as u32, config.roi.size.h as u32));
        }
        let active = self.configs.get(self.active_config)?;
        (active.width > 0 && active.height > 0).then_some((active.width, active.height))
    }

    /// Dumps the next `count` frames to disk
    ///
    /// Frame dumps are silently disabled during secure sessions.
    #[instrument(level = "debug", skip_all, parent = &self.span, fields(count = count, ?format))]
    pub fn set_frame_dump_config(
        &mut self,
        count: u32,
        format: Fourcc,
        config: CaptureConfig,
    ) -> Result<(), SessionError> {
        if self.shutdown_pending || count == 0 {
            return Ok(());
        }
        if self.secure.is_active() {
            info!("Frame dumps are disabled during secure sessions");
            return Ok(());
        }
        if self.frame_dump.is_some() {
            return Err(CaptureError::Busy.into());
        }
        if matches!(self.power_mode, PowerMode::Off | PowerMode::DozeSuspend) {
            return Err(CaptureError::BadDisplay.into());
        }
        let (width, height) = self
            .cwb_resolution(&config)
            .ok_or(SessionError::BadConfig(self.active_config))?;
        let directory = dump_directory(&self.config.dump_dir, self.config.display_id, self.config.display_kind);

        let allocator = self.dump_allocator.as_mut().ok_or(SessionError::Unsupported)?;
        let buffer = allocator.allocate(width, height, format).map_err(|err| {
            warn!(?err, width, height, "Failed to allocate the dump buffer");
            CaptureError::NoResources(err)
        })?;
        let dump = match FrameDump::new(buffer, count, config, directory, self.config.display_kind) {
            Ok(dump) => dump,
            Err((buffer, err)) => {
                warn!(?err, "Failed to map the dump buffer");
                allocator.free(buffer);
                return Err(CaptureError::NoResources(err).into());
            }
        };

        let buffer = dump.buffer();
        if let Err(err) = submit_writeback(
            &mut self.engine,
            &self.capture,
            buffer.as_buffer_ref(),
            buffer.format,
            None,
            dump.config(),
            CaptureClient::FrameDump,
        ) {
            allocator.free(dump.into_buffer());
            return Err(err.into());
        }
        info!(width, height, "Frame dump armed");
        self.frame_dump = Some(dump);
        Ok(())
    }

    fn handle_frame_output(&mut self) {
        let handle_id = self.stack.output_buffer.as_ref().map(|output| output.handle_id);
        match self.capture.frame_output(handle_id) {
            Ok(Some(CaptureClient::FrameDump)) => self.handle_frame_dump(),
            Ok(Some(CaptureClient::Color)) => self.handle_frame_capture(),
            Ok(_) => {}
            Err(err) => warn!(?err, "Capture thread unavailable"),
        }
    }

    fn wait_for_capture(&self, client: CaptureClient) -> CaptureStatus {
        match self.capture.wait(client, self.config.capture_wait) {
            Ok(Some(status)) => status,
            Ok(None) => {
                warn!(?client, wait = ?self.config.capture_wait, "Capture did not complete in time");
                CaptureStatus::TimedOut
            }
            Err(err) => {
                warn!(?err, ?client, "Capture thread unavailable");
                CaptureStatus::UnknownError
            }
        }
    }

    fn handle_frame_capture(&mut self) {
        let status = self.wait_for_capture(CaptureClient::Color);
        debug!(?status, "Colour capture finished");
        self.frame_capture_status = Some(status);
    }

    #[profiling::function]
    fn handle_frame_dump(&mut self) {
        let status = self.wait_for_capture(CaptureClient::FrameDump);
        let Some(dump) = self.frame_dump.as_mut() else {
            debug!("Frame dump capture without an active dump");
            return;
        };

        if status.is_complete() {
            if status == CaptureStatus::TimedOut {
                warn!(index = dump.index(), "Writeback timed out, dumping the buffer anyway");
            }
            let fence = self
                .stack
                .output_buffer
                .as_ref()
                .and_then(|output| output.release_fence.as_ref());
            if let Err(err) = dump.write(fence) {
                warn!(?err, index = dump.index(), "Failed to write the frame dump");
            }
        } else {
            warn!(?status, index = dump.index(), "Skipping frame of the dump");
        }

        let rearmed = dump.advance() && {
            let buffer = dump.buffer();
            match submit_writeback(
                &mut self.engine,
                &self.capture,
                buffer.as_buffer_ref(),
                buffer.format,
                None,
                dump.config(),
                CaptureClient::FrameDump,
            ) {
                Ok(()) => true,
                Err(err) => {
                    warn!(?err, "Failed to re-arm the frame dump");
                    false
                }
            }
        };
        if !rearmed {
            self.release_frame_dump();
        }
    }

    fn release_frame_dump(&mut self) {
        let Some(dump) = self.frame_dump.take() else {
            return;
        };
        let buffer = dump.into_buffer();
        if let Some(allocator) = self.dump_allocator.as_mut() {
            allocator.free(buffer);
        }
        info!("Frame dump finished");
    }

    fn drop_captures(&mut self) {
        match self.capture.teardown() {
            Ok(in_flight) => debug!(in_flight, "Captures dropped"),
            Err(err) => warn!(?err, "Capture thread unavailable"),
        }
        self.frame_capture_status = None;
        self.release_frame_dump();
    }

    /// Aborts every pending writeback of the display
    pub fn teardown_concurrent_writeback(&mut self) -> Result<(), SessionError> {
        if !self.engine.handle_cwb_teardown() {
            return Err(SessionError::Unsupported);
        }
        self.drop_captures();
        Ok(())
    }

    /// The display's colour modes
    pub fn color_modes(&self) -> &ColorModeManager {
        &self.color
    }

    /// Selects the colour mode and render intent applied with the next frame
    pub fn set_color_mode_with_render_intent(
        &mut self,
        mode: ColorMode,
        intent: RenderIntent,
    ) -> Result<(), SessionError> {
        self.color.cache_color_mode_with_render_intent(mode, intent)?;
        self.validated = false;
        self.request_refresh();
        Ok(())
    }

    /// Applies a colour profile chosen by the client
    pub fn set_color_profile(&mut self, name: &str) -> Result<(), SessionError> {
        self.color.set_preferred_from_client(&mut self.engine, name)?;
        self.request_refresh();
        Ok(())
    }

    /// Sets the display wide colour transform
    pub fn set_color_transform(&mut self, matrix: &ColorMatrix) -> Result<(), SessionError> {
        self.color.set_color_transform(&mut self.engine, matrix)?;
        self.request_refresh();
        Ok(())
    }

    /// Reacts to an event of the display driver
    pub fn handle_event(&mut self, event: DisplayEvent) {
        let _guard = self.span.enter();
        match event {
            DisplayEvent::IdleTimeout => debug!("Display idle"),
            DisplayEvent::PostIdleTimeout => {
                self.idle = true;
                if self.engine.is_command_mode() {
                    self.notify(Notification::Idle(true));
                }
            }
            DisplayEvent::PanelDead | DisplayEvent::PowerReset => {
                warn!(?event, "Display needs a reset");
                self.notify(Notification::PowerReset);
            }
        }
    }

    /// Whether the display went idle since the last validate
    pub fn is_idle(&self) -> bool {
        self.idle
    }

    /// Forwards a qsync state change to the client
    pub fn handle_qsync_state(&self, enabled: bool, refresh_rate: u32, qsync_refresh_rate: u32) {
        self.notify(Notification::QsyncChanged {
            enabled,
            refresh_rate,
            qsync_refresh_rate,
        });
    }

    /// Updates the multimedia resource restriction shared by all displays
    pub fn restricted_resource_event(&self, restricted: bool) {
        if self.context.set_restricted(restricted) {
            info!(parent: &self.span, restricted, "Resource restriction changed");
            self.request_refresh();
        }
    }
}

impl<E: CompositionEngine> Drop for CompositionSession<E> {
    fn drop(&mut self) {
        self.release_frame_dump();
    }
}

fn nanos(period: Duration) -> i64 {
    i64::try_from(period.as_nanos()).unwrap_or(i64::MAX)
}
