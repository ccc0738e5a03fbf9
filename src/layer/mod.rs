//! Per-surface layer state
//!
//! A [`Layer`] is the composer's record of one client surface. The client pushes
//! property updates into it between frames, and the layer keeps track of exactly
//! which attributes changed since the last committed frame:
//!
//! - [`GeometryChanges`] accumulate until [`Layer::reset_geometry_changes`] is called
//!   after a successful commit. A bit is only ever set if the stored value actually
//!   changed, setting an attribute to its current value is free.
//! - [`LayerUpdates`] describe content-level changes that force the next frame to be
//!   re-validated, and are cleared once the engine has seen them.
//!
//! ```no_run
//! use hwcomposer::layer::{BlendMode, Composition, GeometryChanges, Layer};
//! use hwcomposer::utils::LayerIdAllocator;
//!
//! let ids = LayerIdAllocator::new();
//! let mut layer = Layer::new(ids.next_id());
//! layer.set_composition_type(Composition::Device).unwrap();
//! layer.set_blend_mode(BlendMode::Coverage);
//! layer.set_plane_alpha(0.5).unwrap();
//! assert!(layer.geometry_changes().contains(GeometryChanges::PLANE_ALPHA));
//! ```

use std::fmt;

use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::{
    buffer::{
        BufferDescriptor, BufferInfo, BufferMetadataProvider, BufferRef, BufferType, Fourcc,
        MetadataError,
    },
    color::{
        ColorMatrix, ColorMetadata, ColorPrimaries, ContentLightLevel, Dataspace, MasteringDisplay,
        PerFrameMetadataKey, HDR_DYNAMIC_METADATA_SIZE, IDENTITY_MATRIX,
    },
    engine::LayerComposition,
    sync::SyncPoint,
    utils::{Buffer as BufferCoords, LayerId, Physical, Rectangle, Transform},
};

bitflags::bitflags! {
    /// Attributes of a layer that changed since the last committed frame
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct GeometryChanges: u32 {
        /// Blend mode changed
        const BLEND_MODE = 0x001;
        /// Dataspace or HDR metadata changed
        const DATASPACE = 0x002;
        /// Destination rectangle changed
        const DISPLAY_FRAME = 0x004;
        /// Plane alpha changed
        const PLANE_ALPHA = 0x008;
        /// Source crop changed
        const SOURCE_CROP = 0x010;
        /// Transform changed
        const TRANSFORM = 0x020;
        /// Z-order changed
        const Z_ORDER = 0x040;
        /// Layer was added to the display
        const ADDED = 0x080;
        /// A layer was removed from the display
        const REMOVED = 0x100;
        /// Format or size of the buffer changed
        const BUFFER_GEOMETRY = 0x200;
        /// Per-layer color transform changed
        const COLOR_TRANSFORM = 0x400;
        /// Layer brightness changed
        const LAYER_BRIGHTNESS = 0x800;
    }
}

bitflags::bitflags! {
    /// Content changes of a layer that require the frame to be validated again
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LayerUpdates: u32 {
        /// Secure flags of the buffer changed
        const SECURITY = 0x01;
        /// Frame rate, interlacing or color space of the buffer changed
        const METADATA_UPDATE = 0x02;
        /// Damage rectangles changed
        const SURFACE_DAMAGE = 0x04;
        /// The whole surface needs to be redrawn
        const SURFACE_INVALIDATE = 0x08;
        /// The client changed the requested composition
        const CLIENT_COMP_REQUEST = 0x10;
        /// The per-layer color transform changed
        const COLOR_TRANSFORM_UPDATE = 0x20;
        /// Static or dynamic HDR metadata changed
        const CONTENT_METADATA = 0x40;
    }
}

/// Composition kind as seen by the client
///
/// Used both for what the client requests and for what the engine selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Composition {
    /// Not a valid composition, rejected on input
    Invalid,
    /// Composed by the client into the client target
    Client,
    /// Composed by display hardware
    Device,
    /// A solid color fill, no buffer
    SolidColor,
    /// A hardware cursor plane
    Cursor,
    /// Sideband stream, unsupported
    Sideband,
    /// Display decoration mask
    DisplayDecoration,
}

/// How a layer is blended with the layers below it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendMode {
    /// No blending
    Opaque,
    /// Pixels are premultiplied by their alpha
    #[default]
    Premultiplied,
    /// Pixels are not premultiplied
    Coverage,
}

/// Errors of property updates on a [`Layer`]
#[derive(Debug, thiserror::Error)]
pub enum LayerError {
    /// A property value is out of range or malformed
    #[error("Invalid layer parameter: {0}")]
    BadParameter(&'static str),
    /// The requested feature is not supported
    #[error("Unsupported layer operation")]
    Unsupported,
}

/// A solid fill color
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Color {
    /// Red
    pub r: u8,
    /// Green
    pub g: u8,
    /// Blue
    pub b: u8,
    /// Alpha
    pub a: u8,
}

impl Color {
    /// Packs the color as 0xAARRGGBB
    pub fn to_argb8888(self) -> u32 {
        (u32::from(self.a) << 24) | (u32::from(self.r) << 16) | (u32::from(self.g) << 8) | u32::from(self.b)
    }
}

const STANDARD_FPS: [u32; 4] = [24, 30, 48, 60];
const MAX_FPS_DELTA: u32 = 2;

/// Snaps a frame rate to the closest standard rate
///
/// The rate is truncated first. If it lies within less than two frames per second of
/// 24, 30, 48 or 60 it is replaced by that rate, otherwise it is left unmodified. This
/// absorbs the jitter of e.g. 29.97 fps sources.
pub fn round_to_standard_fps(fps: f32) -> u32 {
    let frame_rate = fps as u32;
    STANDARD_FPS
        .iter()
        .copied()
        .find(|standard| standard.abs_diff(frame_rate) < MAX_FPS_DELTA)
        .unwrap_or(frame_rate)
}

/// Encodes a plane alpha in [0, 1] to 8 bits
///
/// Values just below one would round to fully opaque, they are stepped down to 254 so that
/// producer and consumer agree on the layer not being opaque.
fn encode_plane_alpha(alpha: f32) -> u8 {
    let encoded = (255.0 * alpha).round() as u8;
    if encoded == u8::MAX && alpha < 1.0 {
        u8::MAX - 1
    } else {
        encoded
    }
}

/// State of one client surface
pub struct Layer {
    id: LayerId,
    z_order: u32,

    requested: Composition,
    requested_orig: Composition,
    device_selected: Composition,

    buffer: Option<BufferDescriptor>,
    buffer_info: BufferInfo,
    acquire_fence: SyncPoint,
    release_fence: Option<SyncPoint>,
    flipped: bool,
    interlaced: bool,
    single_buffer: bool,
    frame_rate: u32,
    has_metadata_refresh_rate: bool,
    extended_content_metadata: Option<Vec<u8>>,

    source_crop: Rectangle<f32, BufferCoords>,
    non_integral_source_crop: bool,
    display_frame: Rectangle<i32, Physical>,
    transform: Transform,
    blend_mode: BlendMode,
    plane_alpha: u8,
    solid_fill_color: u32,
    brightness: f32,

    dataspace: Dataspace,
    dataspace_supported: bool,
    color_metadata: ColorMetadata,
    color_transform: ColorMatrix,
    color_transform_set: bool,

    surface_updated: bool,
    updating: bool,
    dirty_regions: SmallVec<[Rectangle<i32, BufferCoords>; 4]>,
    compatible: bool,
    sdr_dimming_disabled: bool,

    geometry_changes: GeometryChanges,
    updates: LayerUpdates,
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer")
            .field("id", &self.id)
            .field("z_order", &self.z_order)
            .field("requested", &self.requested)
            .field("device_selected", &self.device_selected)
            .field("buffer", &self.buffer.as_ref().map(|b| b.id()))
            .field("format", &self.buffer_info.format)
            .field("geometry_changes", &self.geometry_changes)
            .field("updates", &self.updates)
            .finish_non_exhaustive()
    }
}

impl Layer {
    /// Creates a new layer
    ///
    /// A fresh layer requests device composition and is flagged as
    /// [`GeometryChanges::ADDED`] until the next committed frame.
    pub fn new(id: LayerId) -> Layer {
        Layer {
            id,
            z_order: 0,
            requested: Composition::Device,
            requested_orig: Composition::Device,
            device_selected: Composition::Device,
            buffer: None,
            buffer_info: BufferInfo::default(),
            acquire_fence: SyncPoint::signaled(),
            release_fence: None,
            flipped: false,
            interlaced: false,
            single_buffer: false,
            frame_rate: 0,
            has_metadata_refresh_rate: false,
            extended_content_metadata: None,
            source_crop: Rectangle::zero(),
            non_integral_source_crop: false,
            display_frame: Rectangle::zero(),
            transform: Transform::Normal,
            blend_mode: BlendMode::default(),
            plane_alpha: u8::MAX,
            solid_fill_color: 0,
            brightness: 1.0,
            dataspace: Dataspace::UNKNOWN,
            dataspace_supported: true,
            color_metadata: ColorMetadata::default(),
            color_transform: IDENTITY_MATRIX,
            color_transform_set: false,
            surface_updated: true,
            updating: false,
            dirty_regions: SmallVec::new(),
            compatible: false,
            sdr_dimming_disabled: false,
            geometry_changes: GeometryChanges::ADDED,
            updates: LayerUpdates::empty(),
        }
    }

    /// Id of this layer
    pub fn id(&self) -> LayerId {
        self.id
    }

    /// When set, layer brightness below one is ignored for device composed layers
    pub fn set_sdr_dimming_disabled(&mut self, disabled: bool) {
        self.sdr_dimming_disabled = disabled;
    }

    /// Assigns a new buffer to the layer
    ///
    /// Format, size, security flags and colour metadata are read through `provider`.
    /// The buffer's descriptor is duplicated, the previous one is closed afterwards.
    /// Passing `None` is only valid for layers that do not need a buffer.
    #[profiling::function]
    pub fn set_buffer<P: BufferMetadataProvider + ?Sized>(
        &mut self,
        buffer: Option<BufferRef<'_>>,
        acquire_fence: SyncPoint,
        provider: &P,
    ) -> Result<(), LayerError> {
        let Some(buffer) = buffer else {
            return match self.requested {
                Composition::Device | Composition::Cursor => {
                    warn!(layer = %self.id, requested = ?self.requested, "No buffer for a buffer layer");
                    Err(LayerError::BadParameter("buffer is required for this composition"))
                }
                _ => Ok(()),
            };
        };

        let descriptor = BufferDescriptor::duplicate(buffer).map_err(|err| {
            warn!(layer = %self.id, ?err, "Failed to duplicate buffer descriptor");
            LayerError::BadParameter("buffer descriptor cannot be duplicated")
        })?;

        let info = BufferInfo::query(provider, buffer, &self.buffer_info);
        if info.format != self.buffer_info.format || info.aligned_size != self.buffer_info.aligned_size {
            self.geometry_changes |= GeometryChanges::BUFFER_GEOMETRY;
        }
        if info.is_secure() != self.buffer_info.is_secure()
            || info.is_secure_camera() != self.buffer_info.is_secure_camera()
            || info.is_secure_display() != self.buffer_info.is_secure_display()
        {
            self.updates |= LayerUpdates::SECURITY;
        }

        self.flipped = self.buffer.as_ref().map(|b| b.id()) != Some(buffer.id);
        // the previous descriptor is closed here, after the new one was duplicated
        self.buffer = Some(descriptor);
        self.buffer_info = info;
        self.acquire_fence = acquire_fence;

        self.set_metadata(provider, buffer);
        Ok(())
    }

    fn set_metadata<P: BufferMetadataProvider + ?Sized>(&mut self, provider: &P, buffer: BufferRef<'_>) {
        let mut frame_rate = self.frame_rate;
        if let Ok(fps) = provider.refresh_rate(buffer) {
            if fps != 0.0 {
                frame_rate = round_to_standard_fps(fps);
            }
            self.has_metadata_refresh_rate = true;
        }

        let interlaced = provider.interlaced(buffer).unwrap_or(false);
        if interlaced != self.interlaced {
            debug!(layer = %self.id, old = self.interlaced, new = interlaced, "Interlacing changed");
        }
        if interlaced != self.interlaced || frame_rate != self.frame_rate {
            self.frame_rate = frame_rate;
            self.interlaced = interlaced;
            self.updates |= LayerUpdates::METADATA_UPDATE;
        }

        self.single_buffer = provider.single_buffer_mode(buffer).unwrap_or(false);

        self.validate_and_set_csc(provider, buffer);

        match provider.extended_content_metadata(buffer) {
            Ok(payload) => {
                if self.extended_content_metadata.as_deref() != Some(&payload[..]) {
                    self.extended_content_metadata = Some(payload);
                    self.updates |= LayerUpdates::CONTENT_METADATA;
                }
            }
            Err(MetadataError::Unavailable) => {
                // buffer switch, drop what the previous buffer carried
                if self.extended_content_metadata.take().is_some() {
                    self.updates |= LayerUpdates::CONTENT_METADATA;
                }
            }
            Err(err) => warn!(layer = %self.id, ?err, "Failed to read extended content metadata"),
        }
    }

    /// Resolves the effective colour metadata of the layer
    ///
    /// A known dataspace decides the colour space triple. Metadata embedded in the buffer
    /// is consulted when no dataspace is set, and always for BT.2020 content, as a
    /// dataspace cannot carry mastering display or light level information.
    fn validate_and_set_csc<P: BufferMetadataProvider + ?Sized>(&mut self, provider: &P, buffer: BufferRef<'_>) {
        let mut use_color_metadata = true;
        if self.dataspace != Dataspace::UNKNOWN {
            use_color_metadata = false;
            let space = match self.dataspace.to_color_space() {
                Ok(space) => space,
                Err(err) => {
                    debug!(layer = %self.id, ?err, "Dataspace is not supported");
                    self.dataspace_supported = false;
                    return;
                }
            };
            if space != self.color_metadata.space {
                self.updates |= LayerUpdates::METADATA_UPDATE;
                self.color_metadata.space = space;
            }
        }

        if self.color_metadata.space.primaries == ColorPrimaries::Bt2020 {
            use_color_metadata = true;
        }

        if use_color_metadata {
            let new_metadata = match provider.color_metadata(buffer) {
                Ok(metadata) => metadata,
                Err(MetadataError::Unavailable) => match provider.legacy_color_space(buffer) {
                    Ok(legacy) => match ColorMetadata::from_legacy(legacy, &self.color_metadata) {
                        Ok(metadata) => metadata,
                        Err(err) => {
                            debug!(layer = %self.id, ?err, "Unsupported legacy color space");
                            self.dataspace_supported = false;
                            return;
                        }
                    },
                    Err(_) => self.color_metadata.clone(),
                },
                Err(err) => {
                    warn!(layer = %self.id, ?err, "Failed to read color metadata");
                    self.dataspace_supported = false;
                    return;
                }
            };

            // a known dataspace wins over the triple embedded in the buffer
            let space = if self.dataspace != Dataspace::UNKNOWN {
                self.color_metadata.space
            } else {
                new_metadata.space
            };
            if space != self.color_metadata.space {
                self.color_metadata.space = space;
                self.updates |= LayerUpdates::METADATA_UPDATE;
            }
            if new_metadata.matrix_coefficients != self.color_metadata.matrix_coefficients {
                self.color_metadata.matrix_coefficients = new_metadata.matrix_coefficients;
                self.updates |= LayerUpdates::METADATA_UPDATE;
            }
            if let Some(mastering) = new_metadata.mastering_display {
                if self.color_metadata.mastering_display != Some(mastering) {
                    self.color_metadata.mastering_display = Some(mastering);
                    self.updates |= LayerUpdates::CONTENT_METADATA;
                }
            }
            if let Some(light_level) = new_metadata.content_light_level {
                if self.color_metadata.content_light_level != Some(light_level) {
                    self.color_metadata.content_light_level = Some(light_level);
                    self.updates |= LayerUpdates::CONTENT_METADATA;
                }
            }
            if let Some(payload) = new_metadata.dynamic_metadata {
                if self.color_metadata.dynamic_metadata.as_ref() != Some(&payload) {
                    self.color_metadata.dynamic_metadata = Some(payload);
                    self.updates |= LayerUpdates::CONTENT_METADATA;
                }
            }
        }

        self.dataspace_supported = true;
    }

    /// Sets the damaged regions of the current buffer
    ///
    /// A single rectangle with zero right and bottom edges means nothing changed.
    pub fn set_surface_damage(&mut self, damage: &[Rectangle<i32, BufferCoords>]) {
        self.surface_updated = !(damage.len() == 1 && damage[0].right() == 0 && damage[0].bottom() == 0);

        if !self.updating && self.surface_updated {
            self.updates |= LayerUpdates::SURFACE_INVALIDATE;
        }

        if self.dirty_regions.len() != damage.len() {
            self.updates |= LayerUpdates::SURFACE_INVALIDATE;
        } else if self.dirty_regions.iter().zip(damage).any(|(old, new)| old != new) {
            self.updates |= LayerUpdates::SURFACE_DAMAGE;
        }

        self.dirty_regions = damage.iter().copied().collect();
    }

    /// Sets the blend mode
    pub fn set_blend_mode(&mut self, mode: BlendMode) {
        if self.blend_mode != mode {
            self.geometry_changes |= GeometryChanges::BLEND_MODE;
            self.blend_mode = mode;
        }
    }

    /// Sets the fill color, ignored unless the layer requests [`Composition::SolidColor`]
    pub fn set_color(&mut self, color: Color) {
        if self.requested != Composition::SolidColor {
            return;
        }
        let packed = color.to_argb8888();
        if self.solid_fill_color != packed {
            self.solid_fill_color = packed;
            self.updates |= LayerUpdates::SURFACE_INVALIDATE;
            self.surface_updated = true;
        } else {
            self.surface_updated = false;
        }
        self.buffer_info.format = Some(Fourcc::Argb8888);
        trace!(layer = %self.id, color = format_args!("{:#010x}", packed), "Solid fill color set");
    }

    /// Sets the composition requested by the client
    pub fn set_composition_type(&mut self, composition: Composition) -> Result<(), LayerError> {
        match composition {
            Composition::Invalid => return Err(LayerError::BadParameter("invalid composition type")),
            Composition::Sideband => return Err(LayerError::Unsupported),
            Composition::Client
            | Composition::Device
            | Composition::SolidColor
            | Composition::Cursor
            | Composition::DisplayDecoration => {}
        }

        if composition != self.requested
            || composition != self.device_selected
            || composition == Composition::Client
        {
            self.updates |= LayerUpdates::CLIENT_COMP_REQUEST;
        }
        self.requested = composition;
        self.requested_orig = composition;
        Ok(())
    }

    /// Sets the dataspace of the buffer content
    ///
    /// Deprecated legacy values are translated first.
    pub fn set_dataspace<P: BufferMetadataProvider + ?Sized>(&mut self, dataspace: Dataspace, provider: &P) {
        let dataspace = dataspace.translate_legacy();
        if self.dataspace == dataspace {
            return;
        }
        self.geometry_changes |= GeometryChanges::DATASPACE;
        self.dataspace = dataspace;
        if let Some(buffer) = self.buffer.take() {
            self.validate_and_set_csc(provider, buffer.as_buffer_ref());
            self.buffer = Some(buffer);
        }
    }

    /// Sets the destination rectangle
    pub fn set_display_frame(&mut self, frame: Rectangle<i32, Physical>) {
        if self.display_frame != frame {
            self.geometry_changes |= GeometryChanges::DISPLAY_FRAME;
            self.display_frame = frame;
        }
    }

    /// Sets the plane alpha, in [0, 1]
    pub fn set_plane_alpha(&mut self, alpha: f32) -> Result<(), LayerError> {
        if !(0.0..=1.0).contains(&alpha) {
            return Err(LayerError::BadParameter("plane alpha out of range"));
        }
        let encoded = encode_plane_alpha(alpha);
        if self.plane_alpha != encoded {
            self.geometry_changes |= GeometryChanges::PLANE_ALPHA;
            self.plane_alpha = encoded;
        }
        Ok(())
    }

    /// Sets the source crop
    ///
    /// The stored crop is shrunk to whole pixels. A crop that was not integral to begin
    /// with is remembered, it prevents hardware composition of most layers.
    pub fn set_source_crop(&mut self, crop: Rectangle<f32, BufferCoords>) {
        self.non_integral_source_crop = !crop.is_integral();
        let crop = crop.round_inward();
        if self.source_crop != crop {
            self.geometry_changes |= GeometryChanges::SOURCE_CROP;
            self.source_crop = crop;
        }
    }

    /// Sets the transform from its raw wire value
    pub fn set_transform(&mut self, raw: u32) -> Result<(), LayerError> {
        let transform = Transform::from_raw(raw).ok_or(LayerError::BadParameter("unknown transform"))?;
        if self.transform != transform {
            self.geometry_changes |= GeometryChanges::TRANSFORM;
            self.transform = transform;
        }
        Ok(())
    }

    /// Sets the z-order
    pub fn set_z_order(&mut self, z: u32) {
        if self.z_order != z {
            self.geometry_changes |= GeometryChanges::Z_ORDER;
            self.z_order = z;
        }
    }

    /// Sets the per-layer color transform matrix
    pub fn set_color_transform(&mut self, matrix: &ColorMatrix) {
        if &self.color_transform == matrix {
            return;
        }
        self.color_transform = *matrix;
        self.geometry_changes |= GeometryChanges::COLOR_TRANSFORM;
        self.updates |= LayerUpdates::COLOR_TRANSFORM_UPDATE;
        self.color_transform_set = *matrix != IDENTITY_MATRIX;
    }

    /// Sets static HDR metadata
    ///
    /// Chromaticities are scaled by 50000 and the minimum luminance by 10000. Setting
    /// the red x primary enables the mastering display volume, setting MaxCLL enables
    /// the content light level.
    pub fn set_per_frame_metadata(&mut self, keys: &[PerFrameMetadataKey], values: &[f32]) -> Result<(), LayerError> {
        if keys.len() != values.len() {
            return Err(LayerError::BadParameter("metadata keys and values differ in length"));
        }

        let old_mastering = self.color_metadata.mastering_display;
        let old_light_level = self.color_metadata.content_light_level;
        let mut mastering = old_mastering.unwrap_or_default();
        let mut mastering_enabled = old_mastering.is_some();
        let mut light_level = old_light_level.unwrap_or_default();
        let mut light_level_enabled = old_light_level.is_some();

        let chromaticity = |value: f32| (value * 50000.0) as u32;
        for (key, &value) in keys.iter().zip(values) {
            match key {
                PerFrameMetadataKey::DisplayRedPrimaryX => {
                    mastering_enabled = true;
                    mastering.primaries[0][0] = chromaticity(value);
                }
                PerFrameMetadataKey::DisplayRedPrimaryY => mastering.primaries[0][1] = chromaticity(value),
                PerFrameMetadataKey::DisplayGreenPrimaryX => mastering.primaries[1][0] = chromaticity(value),
                PerFrameMetadataKey::DisplayGreenPrimaryY => mastering.primaries[1][1] = chromaticity(value),
                PerFrameMetadataKey::DisplayBluePrimaryX => mastering.primaries[2][0] = chromaticity(value),
                PerFrameMetadataKey::DisplayBluePrimaryY => mastering.primaries[2][1] = chromaticity(value),
                PerFrameMetadataKey::WhitePointX => mastering.white_point[0] = chromaticity(value),
                PerFrameMetadataKey::WhitePointY => mastering.white_point[1] = chromaticity(value),
                PerFrameMetadataKey::MaxLuminance => mastering.max_luminance = value as u32,
                PerFrameMetadataKey::MinLuminance => mastering.min_luminance = (value * 10000.0) as u32,
                PerFrameMetadataKey::MaxContentLightLevel => {
                    light_level_enabled = true;
                    light_level.max_content_light_level = value as u32;
                }
                PerFrameMetadataKey::MaxFrameAverageLightLevel => {
                    light_level.max_frame_average_light_level = value as u32
                }
                PerFrameMetadataKey::Hdr10PlusSei => {}
            }
        }

        let mastering: Option<MasteringDisplay> = mastering_enabled.then_some(mastering);
        let light_level: Option<ContentLightLevel> = light_level_enabled.then_some(light_level);
        if mastering != old_mastering || light_level != old_light_level {
            self.color_metadata.mastering_display = mastering;
            self.color_metadata.content_light_level = light_level;
            self.updates |= LayerUpdates::CONTENT_METADATA;
            self.geometry_changes |= GeometryChanges::DATASPACE;
        }
        Ok(())
    }

    /// Sets blob valued HDR metadata, only HDR10+ SEI payloads are accepted
    pub fn set_per_frame_metadata_blobs(&mut self, blobs: &[(PerFrameMetadataKey, &[u8])]) -> Result<(), LayerError> {
        for (key, payload) in blobs {
            match key {
                PerFrameMetadataKey::Hdr10PlusSei => {
                    if payload.len() > HDR_DYNAMIC_METADATA_SIZE {
                        warn!(layer = %self.id, size = payload.len(), "HDR10+ payload too large");
                        return Err(LayerError::BadParameter("HDR10+ payload too large"));
                    }
                    if self.color_metadata.dynamic_metadata.as_deref() != Some(*payload) {
                        self.color_metadata.dynamic_metadata = Some(payload.to_vec());
                        self.geometry_changes |= GeometryChanges::DATASPACE;
                        self.updates |= LayerUpdates::CONTENT_METADATA;
                    }
                }
                other => {
                    warn!(layer = %self.id, key = ?other, "Invalid metadata blob key");
                    return Err(LayerError::BadParameter("metadata key does not carry a blob"));
                }
            }
        }
        Ok(())
    }

    /// Sets the layer brightness, in [0, 1]
    pub fn set_brightness(&mut self, brightness: f32) -> Result<(), LayerError> {
        if brightness.is_nan() || !(0.0..=1.0).contains(&brightness) {
            return Err(LayerError::BadParameter("brightness out of range"));
        }
        let brightness =
            if brightness != 1.0 && self.sdr_dimming_disabled && self.requested == Composition::Device {
                1.0
            } else {
                brightness
            };
        if self.brightness != brightness {
            trace!(layer = %self.id, from = self.brightness, to = brightness, "Brightness changed");
            self.brightness = brightness;
            self.geometry_changes |= GeometryChanges::LAYER_BRIGHTNESS;
        }
        Ok(())
    }

    /// Marks the layer as compatible with the client's own composition
    pub fn set_compatible(&mut self, compatible: bool) {
        self.compatible = compatible;
    }

    /// Records the composition the engine picked for this layer
    pub fn set_composition(&mut self, engine: LayerComposition, solid_fill: bool, mask: bool) {
        let selected = match engine {
            LayerComposition::Gpu | LayerComposition::GpuTarget => Composition::Client,
            LayerComposition::Cursor => Composition::Cursor,
            LayerComposition::Hardware | LayerComposition::Stitch if solid_fill => Composition::SolidColor,
            LayerComposition::Hardware if mask && self.requested == Composition::DisplayDecoration => {
                Composition::DisplayDecoration
            }
            LayerComposition::Hardware | LayerComposition::Stitch => Composition::Device,
        };
        self.device_selected = selected;
    }

    /// Accepts the engine's decision as the new requested composition
    pub fn accept_device_composition(&mut self) {
        self.requested = self.device_selected;
    }

    /// Whether any rotation or flip is applied
    pub fn is_rotation_present(&self) -> bool {
        self.transform != Transform::Normal
    }

    /// Whether the source and destination sizes differ, accounting for 90° rotations
    pub fn is_scaling_present(&self) -> bool {
        let src = self.transform.transform_size(self.source_crop.to_i32().size);
        let dst = self.display_frame.size;
        (src.w, src.h) != (dst.w, dst.h)
    }

    /// Whether the last crop had fractional edges
    pub fn is_non_integral_source_crop(&self) -> bool {
        self.non_integral_source_crop
    }

    /// Whether the content changed with the last damage or color update
    pub fn is_surface_updated(&self) -> bool {
        self.surface_updated
    }

    /// Whether the layer's dataspace can be handled in hardware
    pub fn is_dataspace_supported(&self) -> bool {
        match self.requested {
            Composition::Device | Composition::Cursor => self.dataspace_supported,
            _ => true,
        }
    }

    /// Clears accumulated geometry changes
    pub fn reset_geometry_changes(&mut self) {
        self.geometry_changes = GeometryChanges::empty();
    }

    /// Clears content updates once the engine has validated them
    pub fn reset_validation(&mut self) {
        self.updates = LayerUpdates::empty();
    }

    /// Clears per-frame state after a commit
    pub fn reset_per_frame_flags(&mut self) {
        self.updates = LayerUpdates::empty();
        self.acquire_fence = SyncPoint::signaled();
        self.flipped = false;
    }

    /// Flags this layer as updating in the current frame
    pub fn set_updating(&mut self, updating: bool) {
        self.updating = updating;
    }

    /// Stores the fence signalled when the hardware no longer reads the current buffer
    pub fn push_release_fence(&mut self, fence: Option<SyncPoint>) {
        self.release_fence = fence;
    }

    /// Hands out the release fence
    pub fn take_release_fence(&mut self) -> Option<SyncPoint> {
        self.release_fence.take()
    }

    /// The release fence, left in place
    pub fn release_fence(&self) -> Option<&SyncPoint> {
        self.release_fence.as_ref()
    }

    /// Z-order
    pub fn z_order(&self) -> u32 {
        self.z_order
    }

    /// Composition requested by the client, updated by accepted changes
    pub fn requested_composition(&self) -> Composition {
        self.requested
    }

    /// Composition the client originally asked for
    pub fn original_composition(&self) -> Composition {
        self.requested_orig
    }

    /// Composition the engine selected
    pub fn device_composition(&self) -> Composition {
        self.device_selected
    }

    /// The current buffer
    pub fn buffer(&self) -> Option<&BufferDescriptor> {
        self.buffer.as_ref()
    }

    /// Cached buffer properties
    pub fn buffer_info(&self) -> &BufferInfo {
        &self.buffer_info
    }

    /// Whether the buffer carries video content
    pub fn is_video(&self) -> bool {
        self.buffer.is_some() && self.buffer_info.buffer_type == BufferType::Video
    }

    /// Fence to wait on before reading the buffer
    pub fn acquire_fence(&self) -> &SyncPoint {
        &self.acquire_fence
    }

    /// Whether the last buffer was a different allocation than the one before
    pub fn is_flipped(&self) -> bool {
        self.flipped
    }

    /// Whether the buffer content is interlaced
    pub fn is_interlaced(&self) -> bool {
        self.interlaced
    }

    /// Whether the buffer is in single buffer mode
    pub fn is_single_buffer(&self) -> bool {
        self.single_buffer
    }

    /// Frame rate of the content
    pub fn frame_rate(&self) -> u32 {
        self.frame_rate
    }

    /// Overrides the frame rate of layers that do not carry one in their metadata
    pub fn set_frame_rate(&mut self, frame_rate: u32) {
        self.frame_rate = frame_rate;
    }

    /// Whether the frame rate came from the buffer's metadata
    pub fn has_metadata_refresh_rate(&self) -> bool {
        self.has_metadata_refresh_rate
    }

    /// Source crop, in whole pixels
    pub fn source_crop(&self) -> Rectangle<f32, BufferCoords> {
        self.source_crop
    }

    /// Destination rectangle
    pub fn display_frame(&self) -> Rectangle<i32, Physical> {
        self.display_frame
    }

    /// Transform
    pub fn transform(&self) -> Transform {
        self.transform
    }

    /// Blend mode
    pub fn blend_mode(&self) -> BlendMode {
        self.blend_mode
    }

    /// Plane alpha, 8 bit encoded
    pub fn plane_alpha(&self) -> u8 {
        self.plane_alpha
    }

    /// Solid fill color as 0xAARRGGBB
    pub fn solid_fill_color(&self) -> u32 {
        self.solid_fill_color
    }

    /// Layer brightness
    pub fn brightness(&self) -> f32 {
        self.brightness
    }

    /// Dataspace set by the client
    pub fn dataspace(&self) -> Dataspace {
        self.dataspace
    }

    /// Effective colour metadata
    pub fn color_metadata(&self) -> &ColorMetadata {
        &self.color_metadata
    }

    /// Vendor specific content metadata of the current buffer
    pub fn extended_content_metadata(&self) -> Option<&[u8]> {
        self.extended_content_metadata.as_deref()
    }

    /// Per-layer color transform
    pub fn color_transform(&self) -> &ColorMatrix {
        &self.color_transform
    }

    /// Whether a non identity color transform is set
    pub fn is_color_transform_set(&self) -> bool {
        self.color_transform_set
    }

    /// Damage of the current buffer
    pub fn dirty_regions(&self) -> &[Rectangle<i32, BufferCoords>] {
        &self.dirty_regions
    }

    /// See [`Layer::set_compatible`]
    pub fn is_compatible(&self) -> bool {
        self.compatible
    }

    /// Changes accumulated since the last commit
    pub fn geometry_changes(&self) -> GeometryChanges {
        self.geometry_changes
    }

    /// Content updates since the last validate
    pub fn updates(&self) -> LayerUpdates {
        self.updates
    }
}
