//! Secure session transitions
//!
//! Trusted UI sessions run `TuiPrepare -> TuiStart -> TuiEnd` or abort with
//! `TuiPrepare -> TuiUnprepare`, secure display sessions run
//! `SecureDisplayStart -> SecureDisplayEnd`. Every event has exactly one valid
//! predecessor. Ending events stay recorded until the frame completing them was
//! committed, and no other transition may start meanwhile.

use tracing::debug;

use super::SessionError;
use crate::engine::SecureEvent;

/// Tracks the last secure event of a display and whether the display is paused by it
#[derive(Debug, Default)]
pub(crate) struct SecureState {
    event: Option<SecureEvent>,
    pause_pending: bool,
    paused: bool,
}

fn is_ending(event: SecureEvent) -> bool {
    matches!(
        event,
        SecureEvent::TuiEnd | SecureEvent::TuiUnprepare | SecureEvent::SecureDisplayEnd
    )
}

fn predecessor(event: SecureEvent) -> Option<SecureEvent> {
    match event {
        SecureEvent::TuiPrepare | SecureEvent::SecureDisplayStart => None,
        SecureEvent::TuiStart | SecureEvent::TuiUnprepare => Some(SecureEvent::TuiPrepare),
        SecureEvent::TuiEnd => Some(SecureEvent::TuiStart),
        SecureEvent::SecureDisplayEnd => Some(SecureEvent::SecureDisplayStart),
    }
}

impl SecureState {
    /// The recorded event, if a session is active or finishing
    pub fn event(&self) -> Option<SecureEvent> {
        self.event
    }

    /// Whether a secure session is active, including one that is still finishing
    pub fn is_active(&self) -> bool {
        self.event.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Checks `event` against the recorded state without changing it
    ///
    /// The predecessor check runs first, a finished session counts as no session there.
    pub fn check(&self, event: SecureEvent) -> Result<(), SessionError> {
        let settled = self.event.filter(|recorded| !is_ending(*recorded));
        if self.event == Some(event) || settled != predecessor(event) {
            return Err(SessionError::InvalidTransition {
                from: self.event,
                to: event,
            });
        }
        if self.pause_pending || self.event.is_some_and(is_ending) {
            return Err(SessionError::TransitionInFlight(self.event.unwrap_or(event)));
        }
        Ok(())
    }

    /// Records an accepted event
    ///
    /// `needs_refresh` tells whether the engine needs another frame to complete it.
    pub fn record(&mut self, event: SecureEvent, needs_refresh: bool) {
        match event {
            SecureEvent::TuiPrepare | SecureEvent::TuiStart => {
                if needs_refresh {
                    self.pause_pending = true;
                } else {
                    self.paused = true;
                }
            }
            SecureEvent::TuiEnd | SecureEvent::TuiUnprepare => {
                self.paused = false;
                self.pause_pending = false;
            }
            SecureEvent::SecureDisplayStart | SecureEvent::SecureDisplayEnd => {}
        }

        if is_ending(event) && !needs_refresh {
            debug!(?event, "Secure session finished");
            self.event = None;
        } else {
            self.event = Some(event);
        }
    }

    /// Completes the transition of `event` once the engine finished it
    pub fn complete(&mut self, event: SecureEvent) {
        self.event = if is_ending(event) { None } else { Some(event) };
    }

    /// Applies what a committed frame completes, returns whether the display got paused
    pub fn on_commit(&mut self) -> bool {
        if matches!(
            self.event,
            Some(SecureEvent::SecureDisplayEnd | SecureEvent::TuiUnprepare)
        ) {
            debug!(event = ?self.event, "Secure session finished");
            self.event = None;
        }
        if self.pause_pending {
            self.pause_pending = false;
            self.paused = true;
            return true;
        }
        false
    }
}
