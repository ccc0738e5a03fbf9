//! Concurrent writeback (CWB) bookkeeping
//!
//! A concurrent writeback copies the composed frame into a buffer supplied by a
//! capture client, while the frame is scanned out. Several independent clients
//! compete for the single writeback block of a display:
//!
//! - the composer client, polling for the readback fence through the composer interface,
//! - the frame dump path, writing raw frames to disk (see [`dump`]),
//! - in-process colour calibration tools,
//! - external clients, which are told about completion through a [`Notification`].
//!
//! Each request is keyed by the unique handle id of its target buffer. The state of all
//! requests of a display is owned by a small actor thread running a `calloop` event loop;
//! the compositor thread (requests, polls, blocking waits) and the engine's asynchronous
//! completion path ([`CaptureHandle::notify_done`]) talk to it through messages only.
//! Nothing is ever locked across both paths.
//!
//! Per client, a request moves through
//! `Idle -> Requested -> (Signaled | TimedOut | UnknownError) -> Idle`, and a client can
//! have at most one unretrieved result at a time.

use std::{
    fmt, io,
    sync::{mpsc, Arc},
    thread::JoinHandle,
    time::Duration,
};

use calloop::{
    channel::{self, Channel, Sender},
    timer::{TimeoutAction, Timer},
    EventLoop, LoopHandle, LoopSignal, RegistrationToken,
};
use indexmap::IndexMap;
use tracing::{debug, debug_span, error, trace, warn};

use crate::{
    notify::{Notification, NotificationSink},
    sync::SyncPoint,
    utils::DisplayId,
};

pub mod dump;

/// Category of a capture consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureClient {
    /// The composer client, through the readback interface
    Composer,
    /// Raw frame dumps to disk
    FrameDump,
    /// In-process colour tooling
    Color,
    /// Out of process clients, notified asynchronously
    External,
}

/// State of a capture request as seen by a consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureStatus {
    /// The frame carrying the request was committed, completion was not reported yet
    NotChecked,
    /// The writeback completed
    Signaled,
    /// The writeback fence timed out, the buffer content is likely complete
    TimedOut,
    /// The request was dropped, e.g. by a power transition
    UnknownError,
    /// A request is tracked but its fence is not available yet, poll again
    Pending,
    /// No request of this client is tracked
    NotAvailable,
}

impl CaptureStatus {
    /// Maps the status code of an engine completion notification
    pub fn from_code(code: i32) -> CaptureStatus {
        match code {
            0 => CaptureStatus::Signaled,
            code if code == -libc::ETIME => CaptureStatus::TimedOut,
            _ => CaptureStatus::UnknownError,
        }
    }

    /// Whether the buffer may be consumed
    ///
    /// A timed out fence is treated as complete: the writeback finishes within the
    /// timeout even if the completion signal got lost.
    pub fn is_complete(&self) -> bool {
        matches!(self, CaptureStatus::Signaled | CaptureStatus::TimedOut)
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self,
            CaptureStatus::Signaled | CaptureStatus::TimedOut | CaptureStatus::UnknownError
        )
    }
}

/// Errors of the capture path
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// The display cannot capture in its current power state
    #[error("The display is not powered")]
    BadDisplay,
    /// Capturing is not possible right now, or not at all
    #[error("Capture is not supported")]
    Unsupported,
    /// The capture buffer is unusable
    #[error("Invalid capture parameter: {0}")]
    BadParameter(&'static str),
    /// The client already has an outstanding request
    #[error("A capture of this client is still outstanding")]
    Busy,
    /// Allocating or mapping the capture buffer failed
    #[error("Failed to set up the capture buffer")]
    NoResources(#[source] io::Error),
    /// The capture thread could not be started
    #[error("Failed to spawn the capture thread")]
    Spawn(#[source] io::Error),
    /// The capture thread is gone
    #[error("The capture thread exited")]
    ActorGone,
}

/// Result of polling for a readback fence
#[derive(Debug, Clone)]
pub struct Readback {
    /// Outcome of the poll
    pub status: CaptureStatus,
    /// Fence signalled when the buffer is written, if one was handed out
    pub fence: Option<SyncPoint>,
    /// The buffer the request was issued for, `None` if nothing is tracked
    pub handle_id: Option<u64>,
}

/// The writeback output of the last commit, as reported by the engine
#[derive(Debug, Clone)]
pub struct StackOutput {
    /// Identity of the buffer the engine wrote into
    pub handle_id: u64,
    /// Fence signalled once that write completed
    pub fence: Option<SyncPoint>,
}

type Reply<T> = mpsc::SyncSender<T>;

enum Command {
    Request {
        client: CaptureClient,
        handle_id: u64,
        reply: Reply<Result<(), CaptureError>>,
    },
    Cancel {
        handle_id: u64,
    },
    Done {
        status: CaptureStatus,
        handle_id: u64,
        fence: Option<SyncPoint>,
    },
    Poll {
        client: CaptureClient,
        output: Option<StackOutput>,
        reply: Reply<Readback>,
    },
    Wait {
        client: CaptureClient,
        timeout: Duration,
        reply: Reply<Option<CaptureStatus>>,
    },
    FrameOutput {
        handle_id: Option<u64>,
        reply: Reply<Option<CaptureClient>>,
    },
    Teardown {
        reply: Reply<usize>,
    },
    Shutdown,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Request { client, handle_id, .. } => f
                .debug_struct("Request")
                .field("client", client)
                .field("handle_id", handle_id)
                .finish(),
            Command::Cancel { handle_id } => f.debug_struct("Cancel").field("handle_id", handle_id).finish(),
            Command::Done { status, handle_id, .. } => f
                .debug_struct("Done")
                .field("status", status)
                .field("handle_id", handle_id)
                .finish(),
            Command::Poll { client, .. } => f.debug_struct("Poll").field("client", client).finish(),
            Command::Wait { client, timeout, .. } => f
                .debug_struct("Wait")
                .field("client", client)
                .field("timeout", timeout)
                .finish(),
            Command::FrameOutput { handle_id, .. } => f
                .debug_struct("FrameOutput")
                .field("handle_id", handle_id)
                .finish(),
            Command::Teardown { .. } => f.write_str("Teardown"),
            Command::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Cloneable access to the capture state of one display
///
/// Every call is a message to the capture thread; calls returning data block until
/// the thread answered.
#[derive(Debug, Clone)]
pub struct CaptureHandle {
    display: DisplayId,
    sender: Sender<Command>,
}

impl CaptureHandle {
    fn send(&self, command: Command) -> Result<(), CaptureError> {
        self.sender.send(command).map_err(|_| CaptureError::ActorGone)
    }

    fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, CaptureError> {
        let (reply, receiver) = mpsc::sync_channel(1);
        self.send(make(reply))?;
        receiver.recv().map_err(|_| CaptureError::ActorGone)
    }

    /// Starts tracking a capture into `handle_id` for `client`
    ///
    /// Fails with [`CaptureError::Busy`] if `client` still has an unretrieved result or
    /// a request into another buffer.
    pub fn request(&self, client: CaptureClient, handle_id: u64) -> Result<(), CaptureError> {
        self.call(|reply| Command::Request {
            client,
            handle_id,
            reply,
        })?
    }

    /// Stops tracking the request into `handle_id`
    pub fn cancel(&self, handle_id: u64) {
        if self.send(Command::Cancel { handle_id }).is_err() {
            debug!(display = %self.display, handle_id, "Capture thread gone, nothing to cancel");
        }
    }

    /// Reports completion of the writeback into `handle_id`
    ///
    /// `code` is `0` on success, `-ETIME` if the fence timed out, anything else for
    /// other failures. Buffers that are not tracked are ignored.
    pub fn notify_done(&self, code: i32, handle_id: u64, fence: Option<SyncPoint>) {
        let status = CaptureStatus::from_code(code);
        if self
            .send(Command::Done {
                status,
                handle_id,
                fence,
            })
            .is_err()
        {
            warn!(display = %self.display, handle_id, ?status, "Capture completion after shutdown");
        }
    }

    /// Retrieves the readback fence of `client`
    ///
    /// `output` is the writeback output of the last commit, if the engine reported one.
    pub fn poll(&self, client: CaptureClient, output: Option<StackOutput>) -> Result<Readback, CaptureError> {
        self.call(|reply| Command::Poll { client, output, reply })
    }

    /// Blocks until the request of `client` completed, for at most `timeout`
    ///
    /// Returns `None` if the timeout expired, the request is dropped in that case.
    /// Returns [`CaptureStatus::NotAvailable`] if nothing is tracked for `client`.
    pub fn wait(&self, client: CaptureClient, timeout: Duration) -> Result<Option<CaptureStatus>, CaptureError> {
        self.call(|reply| Command::Wait {
            client,
            timeout,
            reply,
        })
    }

    /// Marks the request committed with the last frame as in flight
    ///
    /// `handle_id` is the writeback output of that commit. Returns the client owning
    /// the request, or the first client with an outstanding result if nothing was
    /// written.
    pub fn frame_output(&self, handle_id: Option<u64>) -> Result<Option<CaptureClient>, CaptureError> {
        self.call(|reply| Command::FrameOutput { handle_id, reply })
    }

    /// Drops every tracked request, returning how many were still in flight
    pub fn teardown(&self) -> Result<usize, CaptureError> {
        self.call(|reply| Command::Teardown { reply })
    }
}

/// Owner of the capture thread of one display
///
/// Dropping the manager stops the thread.
#[derive(Debug)]
pub struct CaptureManager {
    handle: CaptureHandle,
    thread: Option<JoinHandle<()>>,
}

impl CaptureManager {
    /// Starts the capture thread for `display`
    ///
    /// Completions of [`CaptureClient::External`] requests are delivered to `sink`.
    pub fn spawn(display_id: DisplayId, sink: Option<Arc<dyn NotificationSink>>) -> Result<Self, CaptureError> {
        let (sender, channel) = channel::channel();
        let span = debug_span!("hwc_capture", display = %display_id);
        let thread = std::thread::Builder::new()
            .name(format!("hwc-capture-{display_id}"))
            .spawn(move || {
                let _guard = span.enter();
                if let Err(err) = run(display_id, sink, channel) {
                    error!(?err, "Capture event loop failed");
                }
            })
            .map_err(CaptureError::Spawn)?;

        Ok(CaptureManager {
            handle: CaptureHandle {
                display: display_id,
                sender,
            },
            thread: Some(thread),
        })
    }

    /// A handle to the capture thread
    pub fn handle(&self) -> CaptureHandle {
        self.handle.clone()
    }
}

impl Drop for CaptureManager {
    fn drop(&mut self) {
        let _ = self.handle.send(Command::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(display = %self.handle.display, "Capture thread panicked");
            }
        }
    }
}

fn run(
    display: DisplayId,
    sink: Option<Arc<dyn NotificationSink>>,
    channel: Channel<Command>,
) -> Result<(), calloop::Error> {
    let mut event_loop: EventLoop<'static, CaptureState> = EventLoop::try_new()?;
    let mut state = CaptureState {
        display,
        sink,
        statuses: IndexMap::new(),
        buffers: IndexMap::new(),
        waiters: IndexMap::new(),
        handle: event_loop.handle(),
        signal: event_loop.get_signal(),
    };

    event_loop
        .handle()
        .insert_source(channel, |event, _, state| match event {
            channel::Event::Msg(command) => state.handle_command(command),
            channel::Event::Closed => state.signal.stop(),
        })
        .map_err(|err| err.error)?;

    debug!("Capture thread running");
    event_loop.run(None, &mut state, |_| {})?;
    state.drop_all();
    debug!("Capture thread stopped");
    Ok(())
}

#[derive(Debug)]
struct Response {
    handle_id: u64,
    status: CaptureStatus,
    fence: Option<SyncPoint>,
}

struct Waiter {
    reply: Reply<Option<CaptureStatus>>,
    timer: RegistrationToken,
}

struct CaptureState {
    display: DisplayId,
    sink: Option<Arc<dyn NotificationSink>>,
    /// Last known result per client
    statuses: IndexMap<CaptureClient, Response>,
    /// Submitted buffers still waiting for a result
    buffers: IndexMap<u64, CaptureClient>,
    waiters: IndexMap<CaptureClient, Waiter>,
    handle: LoopHandle<'static, CaptureState>,
    signal: LoopSignal,
}

impl CaptureState {
    fn handle_command(&mut self, command: Command) {
        trace!(?command, "Capture command");
        match command {
            Command::Request {
                client,
                handle_id,
                reply,
            } => {
                let _ = reply.send(self.request(client, handle_id));
            }
            Command::Cancel { handle_id } => {
                if let Some(client) = self.buffers.shift_remove(&handle_id) {
                    debug!(?client, handle_id, "Capture request cancelled");
                }
            }
            Command::Done {
                status,
                handle_id,
                fence,
            } => self.done(status, handle_id, fence),
            Command::Poll { client, output, reply } => {
                let _ = reply.send(self.poll(client, output));
            }
            Command::Wait {
                client,
                timeout,
                reply,
            } => self.wait(client, timeout, reply),
            Command::FrameOutput { handle_id, reply } => {
                let _ = reply.send(self.frame_output(handle_id));
            }
            Command::Teardown { reply } => {
                let _ = reply.send(self.drop_all());
            }
            Command::Shutdown => self.signal.stop(),
        }
    }

    fn request(&mut self, client: CaptureClient, handle_id: u64) -> Result<(), CaptureError> {
        if handle_id == 0 {
            return Err(CaptureError::BadParameter("capture buffer without identity"));
        }
        if let Some(response) = self.statuses.get(&client) {
            debug!(?client, pending = response.handle_id, status = ?response.status, "Unretrieved capture result");
            return Err(CaptureError::Busy);
        }
        match self.buffers.get(&handle_id) {
            Some(owner) if *owner != client => return Err(CaptureError::Busy),
            Some(_) => return Ok(()),
            None => {}
        }
        if self.buffers.values().any(|owner| *owner == client) {
            return Err(CaptureError::Busy);
        }

        self.buffers.insert(handle_id, client);
        debug!(?client, handle_id, "Capture requested");
        Ok(())
    }

    fn done(&mut self, status: CaptureStatus, handle_id: u64, fence: Option<SyncPoint>) {
        let Some(client) = self.buffers.shift_remove(&handle_id) else {
            trace!(handle_id, "Completion for untracked capture buffer");
            return;
        };
        debug!(?client, handle_id, ?status, "Capture done");

        if let Some(waiter) = self.waiters.shift_remove(&client) {
            self.handle.remove(waiter.timer);
            // the waiter consumes the result
            self.statuses.shift_remove(&client);
            let _ = waiter.reply.send(Some(status));
            return;
        }

        self.statuses.insert(
            client,
            Response {
                handle_id,
                status,
                fence,
            },
        );

        if client == CaptureClient::External {
            let Some(sink) = self.sink.as_ref() else {
                return;
            };
            match sink.notify(self.display, Notification::CaptureDone { status, handle_id }) {
                Ok(()) => {
                    self.statuses.shift_remove(&client);
                }
                Err(err) => warn!(?err, handle_id, "Failed to notify capture completion"),
            }
        }
    }

    fn poll(&mut self, client: CaptureClient, output: Option<StackOutput>) -> Readback {
        let mut handle_id = 0;
        let mut fence = None;
        let mut status = CaptureStatus::NotAvailable;

        if let Some(response) = self.statuses.get(&client) {
            handle_id = response.handle_id;
            status = response.status;
            match response.status {
                CaptureStatus::Signaled => {
                    fence = Some(response.fence.clone().unwrap_or_default());
                }
                CaptureStatus::NotChecked => {
                    // the engine's fence is only good for the request still tracked
                    fence = output
                        .filter(|output| output.handle_id == handle_id)
                        .and_then(|output| output.fence);
                }
                _ => {}
            }
        } else if let Some(output) = output {
            if self.buffers.get(&output.handle_id) == Some(&client) {
                handle_id = output.handle_id;
                status = CaptureStatus::NotChecked;
                fence = output.fence;
            }
        } else if let Some((id, _)) = self.buffers.iter().find(|(_, owner)| **owner == client) {
            handle_id = *id;
            status = CaptureStatus::Pending;
        }

        if handle_id == 0 {
            trace!(?client, "No capture to retrieve");
            return Readback {
                status: CaptureStatus::NotAvailable,
                fence: None,
                handle_id: None,
            };
        }

        let retrieved = fence.is_some() || matches!(status, CaptureStatus::TimedOut | CaptureStatus::UnknownError);
        if retrieved {
            self.buffers.shift_remove(&handle_id);
            self.statuses.shift_remove(&client);
        } else {
            status = CaptureStatus::Pending;
        }

        match status {
            CaptureStatus::TimedOut => warn!(?client, handle_id, "Capture fence timed out"),
            CaptureStatus::UnknownError => error!(?client, handle_id, "Capture failed"),
            _ => trace!(?client, handle_id, ?status, "Capture polled"),
        }

        Readback {
            status,
            fence,
            handle_id: Some(handle_id),
        }
    }

    fn wait(&mut self, client: CaptureClient, timeout: Duration, reply: Reply<Option<CaptureStatus>>) {
        if let Some(response) = self.statuses.get(&client) {
            if response.status.is_terminal() {
                let status = response.status;
                self.statuses.shift_remove(&client);
                let _ = reply.send(Some(status));
                return;
            }
        } else if !self.buffers.values().any(|owner| *owner == client) {
            let _ = reply.send(Some(CaptureStatus::NotAvailable));
            return;
        }

        let timer = self
            .handle
            .insert_source(Timer::from_duration(timeout), move |_, _, state| {
                state.expire(client);
                TimeoutAction::Drop
            });
        let timer = match timer {
            Ok(timer) => timer,
            Err(err) => {
                error!(err = ?err.error, "Failed to arm capture wait timer");
                let _ = reply.send(None);
                return;
            }
        };

        if let Some(previous) = self.waiters.insert(client, Waiter { reply, timer }) {
            self.handle.remove(previous.timer);
            let _ = previous.reply.send(None);
        }
    }

    fn expire(&mut self, client: CaptureClient) {
        let Some(waiter) = self.waiters.shift_remove(&client) else {
            return;
        };
        warn!(?client, "Capture completion wait timed out, dropping the request");
        self.statuses.shift_remove(&client);
        self.buffers.retain(|_, owner| *owner != client);
        let _ = waiter.reply.send(None);
    }

    fn frame_output(&mut self, handle_id: Option<u64>) -> Option<CaptureClient> {
        match handle_id {
            Some(handle_id) => {
                if let Some(client) = self.buffers.get(&handle_id).copied() {
                    self.statuses.insert(
                        client,
                        Response {
                            handle_id,
                            status: CaptureStatus::NotChecked,
                            fence: None,
                        },
                    );
                    Some(client)
                } else {
                    self.statuses
                        .iter()
                        .find(|(_, response)| response.handle_id == handle_id)
                        .map(|(client, _)| *client)
                }
            }
            None => self
                .statuses
                .iter()
                .find(|(_, response)| response.handle_id != 0)
                .map(|(client, _)| *client),
        }
    }

    fn drop_all(&mut self) -> usize {
        let in_flight = self.buffers.len();
        self.buffers.clear();
        self.statuses.clear();
        for (client, waiter) in self.waiters.drain(..) {
            self.handle.remove(waiter.timer);
            debug!(?client, "Capture dropped while waiting");
            let _ = waiter.reply.send(Some(CaptureStatus::UnknownError));
        }
        if in_flight > 0 {
            debug!(in_flight, "Dropped capture requests");
        }
        in_flight
    }
}
