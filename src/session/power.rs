//! Power state and vsync control

use tracing::{debug, info, instrument, warn};

use super::{CompositionSession, SessionError};
use crate::{
    capture::dump::DisplayKind,
    engine::{CompositionEngine, EngineError, PowerMode},
};

impl<E: CompositionEngine> CompositionSession<E> {
    /// Current power state
    pub fn power_mode(&self) -> PowerMode {
        self.power_mode
    }

    /// Changes the power state of the display
    ///
    /// While multimedia resources are restricted, displays other than the builtin
    /// one stay off. Turning the display off drops every outstanding capture.
    /// The fence of the transition becomes the release fence of every layer.
    #[instrument(level = "debug", skip_all, parent = &self.span, fields(?mode, teardown = teardown))]
    pub fn set_power_mode(&mut self, mode: PowerMode, teardown: bool) -> Result<(), SessionError> {
        if self.shutdown_pending {
            return Ok(());
        }

        let mut flush_on_error = self.flush_on_error;
        match mode {
            // every buffer is released when powering off, nothing is left to flush
            PowerMode::Off => flush_on_error = false,
            PowerMode::On | PowerMode::Doze => {
                if self.context.is_restricted()
                    && self.config.display_kind != DisplayKind::Builtin
                    && matches!(self.power_mode, PowerMode::Off | PowerMode::DozeSuspend)
                {
                    info!("Resources are restricted, keeping the display off");
                    return Ok(());
                }
                if let Err(err) = self.color.restore_color_transform(&mut self.engine) {
                    warn!(?err, "Failed to restore the colour transform");
                }
            }
            PowerMode::DozeSuspend => {}
        }

        let fence = match self.engine.set_display_state(mode, teardown) {
            Ok(fence) => fence,
            Err(EngineError::Shutdown) => {
                self.enter_shutdown();
                return Ok(());
            }
            Err(err) => {
                warn!(?err, "Failed to change the power state");
                return Err(SessionError::Engine(err));
            }
        };

        self.flush_on_error = flush_on_error;
        for layer in self.layers.values_mut() {
            layer.push_release_fence(fence.clone());
        }
        self.power_release_fence = fence;
        let previous = std::mem::replace(&mut self.power_mode, mode);
        self.validated = false;

        if mode == PowerMode::Off {
            self.drop_captures();
        }
        info!(?previous, ?mode, "Power state changed");
        Ok(())
    }

    /// Enables or disables vsync notifications
    pub fn set_vsync_enabled(&mut self, enabled: bool) -> Result<(), SessionError> {
        if self.shutdown_pending {
            return Ok(());
        }
        match self.engine.set_vsync_enabled(enabled) {
            Ok(()) => {
                debug!(enabled, "Vsync state changed");
                self.vsync_enabled = enabled;
                Ok(())
            }
            Err(EngineError::Shutdown) => {
                self.enter_shutdown();
                Ok(())
            }
            Err(err) => {
                warn!(?err, enabled, "Failed to change the vsync state");
                Err(SessionError::BadDisplay)
            }
        }
    }

    /// Whether vsync notifications are enabled
    pub fn is_vsync_enabled(&self) -> bool {
        self.vsync_enabled
    }

    pub(super) fn wait_on_previous_fence(&self) {
        if let Some(fence) = &self.retire_fence {
            if fence.wait().is_err() {
                warn!("Interrupted waiting for the previous frame");
            }
        }
    }
}
