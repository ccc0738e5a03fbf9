#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fs::File,
    os::unix::io::{AsFd, OwnedFd},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, Once,
    },
};

use hwcomposer::{
    buffer::{BufferMetadataProvider, BufferRef, BufferUsage, Fourcc, MetadataError, PrivateFlags},
    capture::{
        dump::{DisplayKind, DumpBuffer, DumpBufferAllocator},
        CaptureHandle,
    },
    color::{ColorMatrix, ColorProfileSource},
    config::SessionConfig,
    context::CompositorContext,
    engine::{
        CaptureConfig, CompositionEngine, DisplayConfig, EngineError, LayerComposition, LayerStack, OutputBuffer,
        PowerMode, PrepareStatus, SecureEvent, StackLayerFlags,
    },
    layer::Composition,
    notify::{Notification, NotificationSink, NotifyError},
    session::CompositionSession,
    sync::SyncPoint,
    utils::{clock::ManualClock, Buffer, DisplayId, LayerId, Size, Time},
};

static LOGGING: Once = Once::new();

pub fn init_logging() {
    LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub const VSYNC_60: u32 = 16_666_666;
pub const VSYNC_90: u32 = 11_111_111;
pub const VSYNC_120: u32 = 8_333_333;

pub fn default_configs() -> Vec<DisplayConfig> {
    vec![
        DisplayConfig {
            width: 1080,
            height: 2400,
            vsync_period_ns: VSYNC_60,
            config_group: 0,
        },
        DisplayConfig {
            width: 1080,
            height: 2400,
            vsync_period_ns: VSYNC_120,
            config_group: 0,
        },
        DisplayConfig {
            width: 1440,
            height: 3200,
            vsync_period_ns: VSYNC_90,
            config_group: 1,
        },
    ]
}

/// What the mock engine does and what it saw
#[derive(Debug, Default)]
pub struct Script {
    pub configs: Vec<DisplayConfig>,
    pub active_config: usize,
    /// Layers composed in hardware, unless the session skips them
    pub hardware: HashSet<LayerId>,
    pub prepare_results: VecDeque<EngineError>,
    pub commit_results: VecDeque<EngineError>,
    pub validated: bool,
    pub prepares: usize,
    pub commits: usize,
    pub flushes: usize,
    pub last_stack: Option<LayerStack>,
    /// Stack of the last commit, as the session handed it over
    pub committed_stack: Option<LayerStack>,
    pub power_states: Vec<PowerMode>,
    pub power_error: Option<EngineError>,
    pub secure_events: Vec<SecureEvent>,
    pub secure_needs_refresh: bool,
    pub profiles: Vec<(String, Vec<(String, String)>)>,
    pub applied_profiles: Vec<String>,
    pub color_transforms: usize,
    pub mode_switches: Vec<usize>,
    /// Buffer of the writeback armed for the next commit
    pub writeback: Option<u64>,
    pub writeback_requests: usize,
    pub reject_writeback: bool,
    /// Completion code reported during commit, nothing is reported if unset
    pub writeback_code: Option<i32>,
    pub capture: Option<CaptureHandle>,
    pub cwb_teardowns: usize,
}

#[derive(Debug, Clone)]
pub struct MockEngine {
    pub script: Arc<Mutex<Script>>,
}

impl MockEngine {
    pub fn new() -> Self {
        let script = Script {
            configs: default_configs(),
            ..Default::default()
        };
        MockEngine {
            script: Arc::new(Mutex::new(script)),
        }
    }

    pub fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }
}

impl Script {
    fn decide(&mut self, stack: &mut LayerStack) {
        for entry in &mut stack.layers {
            let Some(id) = entry.id else {
                continue;
            };
            entry.composition = if !entry.flags.contains(StackLayerFlags::SKIP) && self.hardware.contains(&id) {
                LayerComposition::Hardware
            } else {
                LayerComposition::Gpu
            };
        }
        self.validated = true;
        self.last_stack = Some(stack.clone());
    }

    fn present(&mut self, stack: &mut LayerStack) {
        self.commits += 1;
        self.committed_stack = Some(stack.clone());
        for entry in &mut stack.layers {
            entry.buffer.release_fence = Some(SyncPoint::signaled());
        }
        stack.retire_fence = Some(SyncPoint::signaled());
        if let Some(handle_id) = self.writeback.take() {
            stack.output_buffer = Some(OutputBuffer {
                handle_id,
                release_fence: Some(SyncPoint::signaled()),
            });
            if let (Some(code), Some(capture)) = (self.writeback_code, self.capture.as_ref()) {
                capture.notify_done(code, handle_id, Some(SyncPoint::signaled()));
            }
        }
        self.validated = false;
    }
}

impl ColorProfileSource for MockEngine {
    fn color_profiles(&self) -> Result<Vec<String>, EngineError> {
        Ok(self.script().profiles.iter().map(|(name, _)| name.clone()).collect())
    }

    fn color_profile_attributes(&self, name: &str) -> Result<Vec<(String, String)>, EngineError> {
        self.script()
            .profiles
            .iter()
            .find(|(profile, _)| profile == name)
            .map(|(_, attrs)| attrs.clone())
            .ok_or(EngineError::Parameters)
    }

    fn supports_pipe_tonemap(&self) -> bool {
        false
    }

    fn set_color_profile(&mut self, name: &str) -> Result<(), EngineError> {
        self.script().applied_profiles.push(name.to_owned());
        Ok(())
    }

    fn set_color_transform(&mut self, _matrix: &ColorMatrix) -> Result<(), EngineError> {
        self.script().color_transforms += 1;
        Ok(())
    }
}

impl CompositionEngine for MockEngine {
    fn prepare(&mut self, stack: &mut LayerStack) -> Result<PrepareStatus, EngineError> {
        let mut script = self.script();
        script.prepares += 1;
        if let Some(err) = script.prepare_results.pop_front() {
            script.validated = false;
            return Err(err);
        }
        script.decide(stack);
        Ok(PrepareStatus::NeedsCommit)
    }

    fn commit_or_prepare(&mut self, stack: &mut LayerStack, validate_only: bool) -> Result<PrepareStatus, EngineError> {
        self.prepare(stack)?;
        let mut script = self.script();
        let all_hardware = stack
            .layers
            .iter()
            .filter(|entry| entry.id.is_some())
            .all(|entry| entry.composition == LayerComposition::Hardware);
        if validate_only || !all_hardware {
            return Ok(PrepareStatus::NeedsCommit);
        }
        script.present(stack);
        Ok(PrepareStatus::Done)
    }

    fn commit(&mut self, stack: &mut LayerStack) -> Result<(), EngineError> {
        let mut script = self.script();
        if let Some(err) = script.commit_results.pop_front() {
            return Err(err);
        }
        script.present(stack);
        Ok(())
    }

    fn flush(&mut self, _stack: &mut LayerStack) -> Result<(), EngineError> {
        self.script().flushes += 1;
        Ok(())
    }

    fn is_validated(&self) -> bool {
        self.script().validated
    }

    fn configs(&self) -> Vec<DisplayConfig> {
        self.script().configs.clone()
    }

    fn active_config(&self) -> usize {
        self.script().active_config
    }

    fn set_active_config(&mut self, index: usize) -> Result<(), EngineError> {
        let mut script = self.script();
        if index >= script.configs.len() {
            return Err(EngineError::Parameters);
        }
        script.active_config = index;
        script.mode_switches.push(index);
        Ok(())
    }

    fn set_display_state(&mut self, mode: PowerMode, _teardown: bool) -> Result<Option<SyncPoint>, EngineError> {
        let mut script = self.script();
        if let Some(err) = script.power_error.take() {
            return Err(err);
        }
        script.power_states.push(mode);
        Ok(Some(SyncPoint::signaled()))
    }

    fn set_vsync_enabled(&mut self, _enabled: bool) -> Result<(), EngineError> {
        Ok(())
    }

    fn capture_concurrent_writeback(
        &mut self,
        buffer: BufferRef<'_>,
        _acquire_fence: Option<SyncPoint>,
        _config: &CaptureConfig,
    ) -> Result<(), EngineError> {
        let mut script = self.script();
        if script.reject_writeback {
            return Err(EngineError::Parameters);
        }
        script.writeback_requests += 1;
        script.writeback = Some(buffer.id);
        Ok(())
    }

    fn is_writeback_format_supported(&self, format: Fourcc) -> bool {
        matches!(format, Fourcc::Argb8888 | Fourcc::Abgr8888 | Fourcc::Bgra8888)
    }

    fn handle_cwb_teardown(&mut self) -> bool {
        let mut script = self.script();
        script.cwb_teardowns += 1;
        script.writeback = None;
        true
    }

    fn handle_secure_event(&mut self, event: SecureEvent) -> Result<bool, EngineError> {
        let mut script = self.script();
        script.secure_events.push(event);
        Ok(script.secure_needs_refresh)
    }
}

/// Metadata of a test buffer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferSpec {
    pub format: Fourcc,
    pub width: u32,
    pub height: u32,
    pub secure: bool,
    pub front_buffer: bool,
}

impl Default for BufferSpec {
    fn default() -> Self {
        BufferSpec {
            format: Fourcc::Argb8888,
            width: 100,
            height: 100,
            secure: false,
            front_buffer: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct MockProvider {
    buffers: Mutex<HashMap<u64, BufferSpec>>,
}

impl MockProvider {
    pub fn insert(&self, id: u64, spec: BufferSpec) {
        self.buffers.lock().unwrap().insert(id, spec);
    }

    fn spec(&self, buffer: BufferRef<'_>) -> Result<BufferSpec, MetadataError> {
        self.buffers
            .lock()
            .unwrap()
            .get(&buffer.id)
            .copied()
            .ok_or(MetadataError::Unavailable)
    }
}

impl BufferMetadataProvider for MockProvider {
    fn format(&self, buffer: BufferRef<'_>) -> Result<Fourcc, MetadataError> {
        self.spec(buffer).map(|spec| spec.format)
    }

    fn aligned_size(&self, buffer: BufferRef<'_>) -> Result<Size<u32, Buffer>, MetadataError> {
        self.spec(buffer).map(|spec| Size::from((spec.width, spec.height)))
    }

    fn unaligned_size(&self, buffer: BufferRef<'_>) -> Result<Size<u32, Buffer>, MetadataError> {
        self.aligned_size(buffer)
    }

    fn allocation_size(&self, buffer: BufferRef<'_>) -> Result<u64, MetadataError> {
        self.spec(buffer)
            .map(|spec| u64::from(spec.width) * u64::from(spec.height) * 4)
    }

    fn private_flags(&self, buffer: BufferRef<'_>) -> Result<PrivateFlags, MetadataError> {
        let spec = self.spec(buffer)?;
        Ok(if spec.secure {
            PrivateFlags::SECURE_BUFFER
        } else {
            PrivateFlags::empty()
        })
    }

    fn usage(&self, buffer: BufferRef<'_>) -> Result<BufferUsage, MetadataError> {
        let spec = self.spec(buffer)?;
        Ok(if spec.front_buffer {
            BufferUsage::FRONT_BUFFER
        } else {
            BufferUsage::empty()
        })
    }
}

/// Everything a notification sink received
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<(DisplayId, Notification)>>,
}

impl RecordingSink {
    pub fn refreshes(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, event)| *event == Notification::Refresh)
            .count()
    }

    pub fn take(&self) -> Vec<Notification> {
        self.events
            .lock()
            .unwrap()
            .drain(..)
            .map(|(_, event)| event)
            .collect()
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, display: DisplayId, notification: Notification) -> Result<(), NotifyError> {
        self.events.lock().unwrap().push((display, notification));
        Ok(())
    }
}

/// Dump buffers backed by anonymous temporary files
#[derive(Debug, Default)]
pub struct TempAllocator {
    pub next_id: u64,
    pub live: Arc<AtomicUsize>,
}

impl DumpBufferAllocator for TempAllocator {
    fn allocate(&mut self, width: u32, height: u32, format: Fourcc) -> std::io::Result<DumpBuffer> {
        let size = width as usize * height as usize * 4;
        let file = tempfile::tempfile()?;
        file.set_len(size as u64)?;
        self.next_id += 1;
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(DumpBuffer {
            id: 0xd000 + self.next_id,
            fd: OwnedFd::from(file),
            width,
            height,
            format,
            size,
        })
    }

    fn free(&mut self, buffer: DumpBuffer) {
        drop(buffer);
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A client buffer with a real file descriptor
#[derive(Debug)]
pub struct TestBuffer {
    pub id: u64,
    file: File,
}

impl TestBuffer {
    pub fn new(id: u64) -> Self {
        TestBuffer {
            id,
            file: tempfile::tempfile().unwrap(),
        }
    }

    pub fn handle(&self) -> BufferRef<'_> {
        BufferRef::new(self.id, self.file.as_fd())
    }
}

pub struct Fixture {
    pub session: CompositionSession<MockEngine>,
    pub engine: MockEngine,
    pub provider: Arc<MockProvider>,
    pub sink: Arc<RecordingSink>,
    pub context: Arc<CompositorContext>,
    pub clock: Arc<ManualClock>,
    pub client_target: TestBuffer,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(SessionConfig::new(DisplayId(0), DisplayKind::Builtin))
    }

    pub fn with_config(config: SessionConfig) -> Self {
        init_logging();
        let engine = MockEngine::new();
        let provider = Arc::new(MockProvider::default());
        let sink = Arc::new(RecordingSink::default());
        let context = CompositorContext::new();
        let clock = Arc::new(ManualClock::new(Time::from_nanos(1_000_000_000)));

        let session = CompositionSession::new(
            engine.clone(),
            context.clone(),
            provider.clone(),
            sink.clone(),
            config,
        )
        .unwrap()
        .with_clock(clock.clone());
        engine.script().capture = Some(session.capture_handle());

        let client_target = TestBuffer::new(0xc000);
        provider.insert(client_target.id, BufferSpec::default());

        Fixture {
            session,
            engine,
            provider,
            sink,
            context,
            clock,
            client_target,
        }
    }

    pub fn power_on(&mut self) {
        self.session.set_power_mode(PowerMode::On, false).unwrap();
    }

    /// Creates a layer showing `buffer`, which is registered with `spec`
    pub fn add_layer(&mut self, buffer: &TestBuffer, spec: BufferSpec) -> LayerId {
        self.provider.insert(buffer.id, spec);
        let id = self.session.create_layer();
        self.session
            .set_layer_buffer(id, Some(buffer.handle()), SyncPoint::signaled())
            .unwrap();
        id
    }

    pub fn set_client_target(&mut self) {
        self.session
            .set_client_target(
                Some(self.client_target.handle()),
                SyncPoint::signaled(),
                hwcomposer::color::Dataspace::UNKNOWN,
                &[],
            )
            .unwrap();
    }

    /// Validates, accepts and presents one frame
    pub fn frame(&mut self) -> Option<SyncPoint> {
        self.set_client_target();
        self.session.validate().unwrap();
        self.session.accept_changes().unwrap();
        self.session.present().unwrap()
    }

    pub fn composition(&self, id: LayerId) -> Composition {
        self.session.layer(id).unwrap().device_composition()
    }
}
