//! Events delivered to the composer client
//!
//! Sessions never call into the client directly. Everything the client has to learn
//! asynchronously, vsync, refresh requests, completed captures, goes through a
//! [`NotificationSink`]. The [`Callbacks`] registry is the usual sink: the client registers
//! one handler per [`NotificationKind`], and notifications without a handler are dropped
//! with [`NotifyError::NoResources`].

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tracing::trace;

use crate::{capture::CaptureStatus, session::VsyncPeriodChangeTimeline, utils::DisplayId, utils::Time};

/// An event for the client
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A display was connected or disconnected
    Hotplug {
        /// Whether the display is connected now
        connected: bool,
    },
    /// The display needs a new frame
    Refresh,
    /// A vsync happened
    Vsync {
        /// Time of the vsync
        timestamp: Time,
        /// Current vsync period
        period: Duration,
    },
    /// The timeline of a pending vsync period change moved
    VsyncPeriodTimingChanged {
        /// The updated timeline
        timeline: VsyncPeriodChangeTimeline,
    },
    /// A seamless mode switch became possible again
    SeamlessPossible,
    /// A capture requested by an external client completed
    CaptureDone {
        /// Outcome of the capture
        status: CaptureStatus,
        /// Identity of the capture buffer
        handle_id: u64,
    },
    /// Qsync (adaptive sync) state changed
    QsyncChanged {
        /// Whether qsync is enabled
        enabled: bool,
        /// Current refresh rate
        refresh_rate: u32,
        /// Refresh rate in qsync mode
        qsync_refresh_rate: u32,
    },
    /// The display hardware needs to be reset
    PowerReset,
    /// The display went idle or left idle state
    Idle(bool),
}

impl Notification {
    /// Kind of this notification
    pub fn kind(&self) -> NotificationKind {
        match self {
            Notification::Hotplug { .. } => NotificationKind::Hotplug,
            Notification::Refresh => NotificationKind::Refresh,
            Notification::Vsync { .. } => NotificationKind::Vsync,
            Notification::VsyncPeriodTimingChanged { .. } => NotificationKind::VsyncPeriodTimingChanged,
            Notification::SeamlessPossible => NotificationKind::SeamlessPossible,
            Notification::CaptureDone { .. } => NotificationKind::CaptureDone,
            Notification::QsyncChanged { .. } => NotificationKind::QsyncChanged,
            Notification::PowerReset => NotificationKind::PowerReset,
            Notification::Idle(_) => NotificationKind::Idle,
        }
    }
}

/// Kinds of [`Notification`]s, handlers are registered per kind
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    Hotplug,
    Refresh,
    Vsync,
    VsyncPeriodTimingChanged,
    SeamlessPossible,
    CaptureDone,
    QsyncChanged,
    PowerReset,
    Idle,
}

/// Errors delivering a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum NotifyError {
    /// No handler is registered for this kind of notification
    #[error("No handler registered for {0:?}")]
    NoResources(NotificationKind),
}

/// Receiver of notifications
pub trait NotificationSink: Send + Sync {
    /// Delivers `notification` for `display`
    fn notify(&self, display: DisplayId, notification: Notification) -> Result<(), NotifyError>;
}

type Handler = Arc<dyn Fn(DisplayId, Notification) + Send + Sync>;

/// A registry of notification handlers
#[derive(Default)]
pub struct Callbacks {
    handlers: Mutex<HashMap<NotificationKind, Handler>>,
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Callbacks")
            .field("registered", &handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Callbacks {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for `kind`, replacing any previous one
    pub fn register<F>(&self, kind: NotificationKind, handler: F)
    where
        F: Fn(DisplayId, Notification) + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, Arc::new(handler));
    }

    /// Removes the handler for `kind`
    pub fn unregister(&self, kind: NotificationKind) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&kind);
    }

    /// Whether a handler for `kind` is registered
    pub fn is_registered(&self, kind: NotificationKind) -> bool {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&kind)
    }
}

impl NotificationSink for Callbacks {
    fn notify(&self, display_id: DisplayId, notification: Notification) -> Result<(), NotifyError> {
        let kind = notification.kind();
        // the handler runs unlocked, it may well register other handlers
        let handler = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned();
        let Some(handler) = handler else {
            trace!(display = %display_id, ?kind, "Dropping notification without handler");
            return Err(NotifyError::NoResources(kind));
        };
        handler(display_id, notification);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn unregistered_kind_is_dropped() {
        let callbacks = Callbacks::new();
        assert_eq!(
            callbacks.notify(DisplayId(0), Notification::Refresh),
            Err(NotifyError::NoResources(NotificationKind::Refresh))
        );
    }

    #[test]
    fn handlers_are_per_kind() {
        let callbacks = Callbacks::new();
        let refreshes = Arc::new(AtomicUsize::new(0));
        callbacks.register(NotificationKind::Refresh, {
            let refreshes = refreshes.clone();
            move |display, notification| {
                assert_eq!(display, DisplayId(1));
                assert_eq!(notification, Notification::Refresh);
                refreshes.fetch_add(1, Ordering::SeqCst);
            }
        });

        callbacks.notify(DisplayId(1), Notification::Refresh).unwrap();
        assert!(callbacks.notify(DisplayId(1), Notification::PowerReset).is_err());
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);

        callbacks.unregister(NotificationKind::Refresh);
        assert!(!callbacks.is_registered(NotificationKind::Refresh));
        assert!(callbacks.notify(DisplayId(1), Notification::Refresh).is_err());
    }

    #[test]
    fn handler_may_reenter_registry() {
        let callbacks = Arc::new(Callbacks::new());
        callbacks.register(NotificationKind::Hotplug, {
            let callbacks = Arc::downgrade(&callbacks);
            move |_, _| {
                if let Some(callbacks) = callbacks.upgrade() {
                    callbacks.register(NotificationKind::Refresh, |_, _| {});
                }
            }
        });
        callbacks
            .notify(DisplayId(0), Notification::Hotplug { connected: true })
            .unwrap();
        assert!(callbacks.is_registered(NotificationKind::Refresh));
    }
}
