//! Layer stack assembly and the validate bookkeeping around it

use indexmap::IndexMap;
use tracing::trace;

use super::{CompositionSession, LayerRequestKind, ValidateResult};
use crate::{
    buffer::{format, BufferUsage},
    color::ColorRange,
    engine::{
        CompositionEngine, LayerComposition, LayerRequest, LayerStack, StackBuffer, StackFlags, StackLayer,
        StackLayerFlags,
    },
    layer::{Composition, Layer, LayerUpdates},
    utils::{LayerId, Rectangle},
};

/// With more layers than this, every layer is treated as updating
const MAX_TRACKED_LAYERS: usize = 32;

/// Snapshot of `layer` for the engine, without any derived flags
pub(super) fn stack_layer(layer: &Layer) -> StackLayer {
    let info = layer.buffer_info();
    StackLayer {
        id: Some(layer.id()),
        composition: LayerComposition::Gpu,
        flags: StackLayerFlags::empty(),
        request: LayerRequest::default(),
        buffer: StackBuffer {
            id: layer.buffer().map_or(0, |buffer| buffer.id()),
            format: info.format,
            width: info.aligned_size.w,
            height: info.aligned_size.h,
            color_metadata: layer.color_metadata().clone(),
            acquire_fence: Some(layer.acquire_fence().clone()),
            release_fence: None,
        },
        src_rect: layer.source_crop(),
        dst_rect: layer.display_frame(),
        dirty_regions: layer.dirty_regions().iter().copied().collect(),
        transform: layer.transform(),
        plane_alpha: layer.plane_alpha(),
        z_order: layer.z_order(),
        solid_fill_color: layer.solid_fill_color(),
        brightness: layer.brightness(),
        frame_rate: layer.frame_rate(),
        geometry_changes: layer.geometry_changes().bits(),
        updates: layer.updates().bits(),
        color_transform: layer.is_color_transform_set().then(|| *layer.color_transform()),
    }
}

/// BT.2020 with a PQ or HLG transfer, or extended range half float content
pub(super) fn is_hdr_content(layer: &Layer) -> bool {
    let space = layer.color_metadata().space;
    let float = layer.buffer_info().format.is_some_and(format::is_floating_point);
    space.is_hdr() || (float && space.range == ColorRange::Extended)
}

impl<E: CompositionEngine> CompositionSession<E> {
    /// Ids of all layers, bottom to top
    pub(super) fn layer_order(&self) -> Vec<LayerId> {
        let mut order: Vec<_> = self
            .layers
            .values()
            .map(|layer| (layer.z_order(), layer.id()))
            .collect();
        order.sort_unstable();
        order.into_iter().map(|(_, id)| id).collect()
    }

    /// Rebuilds the stack handed to the engine from the current layer state
    #[profiling::function]
    pub(super) fn build_layer_stack(&mut self) {
        let order = self.layer_order();
        let top = order.last().copied();
        let client_target_ready = self.client_target.buffer().is_some();
        let track_updates = self.layers.len() <= MAX_TRACKED_LAYERS;

        let mut stack = LayerStack {
            layers: Vec::with_capacity(order.len() + 1),
            ..Default::default()
        };
        let mut geometry_changes = self.geometry_changes;

        for id in order {
            let Some(layer) = self.layers.get_mut(&id) else {
                continue;
            };
            let mut entry = stack_layer(layer);
            let mut flags = StackLayerFlags::empty();
            let info = layer.buffer_info();
            let requested = layer.requested_composition();

            let mut skip = false;
            let mut solid_fill = false;
            if requested == Composition::Client || !client_target_ready {
                skip = true;
            } else if requested == Composition::SolidColor {
                solid_fill = true;
            }
            if !layer.is_dataspace_supported() {
                skip = true;
            }

            if self.config.zero_swap_interval {
                entry.buffer.acquire_fence = None;
            }

            let video = layer.is_video();
            if video {
                flags |= StackLayerFlags::VIDEO;
                stack.flags |= StackFlags::VIDEO_PRESENT;
            }
            let secure = info.is_secure();
            if secure {
                flags |= StackLayerFlags::SECURE;
                stack.flags |= StackFlags::SECURE_PRESENT;
            }
            if info.is_secure_display() {
                flags |= StackLayerFlags::SECURE_DISPLAY;
                stack.flags |= StackFlags::SECURE_PRESENT;
            }
            let front_buffer = info.usage.contains(BufferUsage::FRONT_BUFFER);
            if front_buffer {
                flags |= StackLayerFlags::FRONT_BUFFER;
                stack.flags |= StackFlags::FRONT_BUFFER_PRESENT;
            }
            let single_buffer =
                layer.is_single_buffer() && !(layer.is_rotation_present() || layer.is_scaling_present());
            if single_buffer {
                flags |= StackLayerFlags::SINGLE_BUFFER;
                stack.flags |= StackFlags::SINGLE_BUFFER_PRESENT;
            }
            let hdr = is_hdr_content(layer) && !self.config.disable_hdr;
            if hdr {
                flags |= StackLayerFlags::HDR;
                stack.flags |= StackFlags::HDR_PRESENT;
            }

            // fractional crops are only worth the hardware for content that must not hit the GPU
            if layer.is_non_integral_source_crop() && !(secure || hdr || single_buffer || solid_fill || video) {
                skip = true;
            }

            if !skip && requested == Composition::Cursor && top == Some(id) {
                flags |= StackLayerFlags::CURSOR;
                stack.flags |= StackFlags::CURSOR_PRESENT;
            }

            // dimmed solid fills are left to the client
            if solid_fill && layer.brightness() != 1.0 {
                skip = true;
                solid_fill = false;
            }

            if skip {
                flags |= StackLayerFlags::SKIP;
                stack.flags |= StackFlags::SKIP_PRESENT;
            }

            if solid_fill {
                flags |= StackLayerFlags::SOLID_FILL;
                let size = entry.dst_rect.size;
                entry.src_rect = Rectangle::from_size((size.w as f32, size.h as f32).into());
                entry.buffer.width = size.w.max(0) as u32;
                entry.buffer.height = size.h.max(0) as u32;
            }

            if layer.has_metadata_refresh_rate() {
                flags |= StackLayerFlags::HAS_METADATA_REFRESH_RATE;
                stack.flags |= StackFlags::USE_METADATA_REFRESH_RATE;
            }

            stack.display_rect = stack.display_rect.merge(entry.dst_rect);
            geometry_changes |= layer.geometry_changes();

            let updating = !track_updates
                || single_buffer
                || front_buffer
                || video
                || layer.is_surface_updated()
                || !layer.geometry_changes().is_empty();
            layer.set_updating(updating);
            if updating {
                flags |= StackLayerFlags::UPDATING;
            }

            if layer.is_color_transform_set() {
                flags |= StackLayerFlags::COLOR_TRANSFORM;
            }
            if layer.original_composition() == Composition::DisplayDecoration {
                flags |= StackLayerFlags::MASK;
                stack.flags |= StackFlags::MASK_PRESENT;
            }
            if layer.is_compatible() {
                flags |= StackLayerFlags::COMPATIBLE;
            }

            trace!(layer = %id, ?flags, "Stack layer");
            entry.flags = flags;
            stack.layers.push(entry);
        }

        if !geometry_changes.is_empty() || !self.geometry_changes_on_doze_suspend.is_empty() {
            stack.flags |= StackFlags::GEOMETRY_CHANGED;
        }

        let dataspace = self.color.current().0.client_target_dataspace();
        self.client_target.set_dataspace(dataspace, &*self.provider);
        stack.layers.push(self.client_target_entry());

        stack.client_incompatible = self.frame_dump.is_some();
        self.stack = stack;
    }

    fn client_target_entry(&self) -> StackLayer {
        let mut target = stack_layer(&self.client_target);
        target.id = None;
        target.composition = LayerComposition::GpuTarget;
        if self.config.zero_swap_interval {
            target.buffer.acquire_fence = None;
        }
        if self.client_target.is_surface_updated() || !self.client_target.geometry_changes().is_empty() {
            target.flags |= StackLayerFlags::UPDATING;
        }
        target
    }

    /// Brings the client target entry of a built stack up to date
    ///
    /// The client renders its target after validate, so the entry the engine commits has
    /// to follow the latest buffer. The engine's requests on the entry are kept.
    pub(super) fn refresh_stack_client_target(&mut self) {
        let fresh = self.client_target_entry();
        let Some(target) = self.stack.client_target_mut() else {
            return;
        };
        target.buffer = fresh.buffer;
        target.dirty_regions = fresh.dirty_regions;
        target.geometry_changes = fresh.geometry_changes;
        target.updates = fresh.updates;
        target.flags |= fresh.flags;
        trace!(buffer = target.buffer.id, "Client target refreshed");
    }

    /// Whether the engine's last decision still holds for the current layers
    ///
    /// Holds if the engine considers its last prepare valid and every layer was left
    /// to the client. The change list is rebuilt from the cached decision.
    pub(super) fn can_skip_validate(&mut self) -> bool {
        if !self.engine.is_validated() || self.layers.is_empty() || self.layer_stack_invalid {
            return false;
        }

        let mut changes = IndexMap::new();
        for (id, layer) in &self.layers {
            let skipped = self
                .stack
                .layer(*id)
                .is_some_and(|entry| entry.flags.contains(StackLayerFlags::SKIP));
            if !skipped
                || layer.device_composition() != Composition::Client
                || layer.updates().contains(LayerUpdates::CLIENT_COMP_REQUEST)
            {
                return false;
            }
            if layer.requested_composition() != Composition::Client {
                changes.insert(*id, Composition::Client);
            }
        }

        trace!(changes = changes.len(), "Skipping validate");
        self.layer_changes = changes;
        self.has_client_composition = true;
        true
    }

    /// Hands every layer to the client, used when the engine refused to prepare
    pub(super) fn mark_layers_for_client_composition(&mut self) {
        for entry in self.stack.layers.iter_mut().filter(|entry| entry.id.is_some()) {
            entry.composition = LayerComposition::Gpu;
            entry.flags |= StackLayerFlags::SKIP;
        }
        self.stack.flags |= StackFlags::SKIP_PRESENT;
    }

    /// Collects the engine's decision into the change and request lists
    pub(super) fn post_prepare(&mut self) -> ValidateResult {
        for entry in &self.stack.layers {
            let Some(id) = entry.id else {
                continue;
            };
            let Some(layer) = self.layers.get_mut(&id) else {
                continue;
            };

            if matches!(entry.composition, LayerComposition::Hardware | LayerComposition::Stitch) {
                self.layer_requests.insert(id, LayerRequestKind::ClearClientTarget);
            }

            let requested = layer.requested_composition();
            layer.set_composition(
                entry.composition,
                entry.flags.contains(StackLayerFlags::SOLID_FILL),
                entry.flags.contains(StackLayerFlags::MASK),
            );
            let selected = layer.device_composition();
            if selected == Composition::Client {
                self.has_client_composition = true;
            }
            if requested != selected {
                self.layer_changes.insert(id, selected);
            }
            layer.reset_validation();
        }
        self.client_target.reset_validation();

        self.layer_stack_invalid = false;
        self.validated = true;
        self.stack.client_incompatible = false;
        self.validate_result()
    }

    pub(super) fn validate_result(&self) -> ValidateResult {
        ValidateResult {
            changed_types: self.layer_changes.len(),
            requests: self.layer_requests.len(),
            has_changes: !self.layer_changes.is_empty()
                || (self.has_client_composition && !self.layer_requests.is_empty()),
        }
    }

    /// Caps the frame rate of layers without a rate of their own to the display's rate
    pub(super) fn update_refresh_rate(&mut self) {
        let throttle = self.context.throttling_refresh_rate();
        let rate = match throttle {
            0 => self.current_refresh_rate,
            throttle => self.current_refresh_rate.min(throttle),
        };
        for layer in self.layers.values_mut() {
            if !layer.has_metadata_refresh_rate() {
                layer.set_frame_rate(rate);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{layer::GeometryChanges, utils::LayerIdAllocator};

    #[test]
    fn snapshot_carries_layer_state() {
        let mut layer = Layer::new(LayerIdAllocator::new().next_id());
        layer.set_z_order(4);
        layer.set_plane_alpha(0.5).unwrap();
        layer.set_display_frame(Rectangle::from_extremities((0, 0), (64, 32)));

        let entry = stack_layer(&layer);
        assert_eq!(entry.id, Some(layer.id()));
        assert_eq!(entry.z_order, 4);
        assert_eq!(entry.plane_alpha, 128);
        assert_eq!(entry.buffer.id, 0);
        assert_eq!(entry.dst_rect, layer.display_frame());
        assert!(entry.color_transform.is_none());
        assert_ne!(entry.geometry_changes & GeometryChanges::ADDED.bits(), 0);
    }

    #[test]
    fn sdr_content_is_not_hdr() {
        let layer = Layer::new(LayerIdAllocator::new().next_id());
        assert!(!is_hdr_content(&layer));
    }
}
