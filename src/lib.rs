#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

//! # hwcomposer: per-display composition sessions
//!
//! This crate sits between a window system and the display hardware of a device. For
//! every frame it decides which layers the display hardware composes directly and which
//! ones the client has to render into a single client target buffer first, and it keeps
//! track of everything that outlives a single frame: fences, power states, refresh
//! rate changes, colour modes, writeback captures and secure sessions.
//!
//! ## Structure of the crate
//!
//! - [`session`] contains [`CompositionSession`](session::CompositionSession), the state
//!   machine driving one display through validate and present.
//! - [`layer`] contains the per-layer state the client edits between frames.
//! - [`engine`] defines the [`CompositionEngine`](engine::CompositionEngine) trait the
//!   display hardware is driven through, and the [`LayerStack`](engine::LayerStack) it is
//!   handed every frame.
//! - [`color`] maps colour modes and render intents to the display's colour profiles.
//! - [`capture`] routes concurrent writeback requests of several clients through a
//!   dedicated thread, and dumps frames to disk.
//! - [`notify`] carries events back to the client.
//!
//! [`buffer`], [`sync`] and [`utils`] contain the supporting types.
//!
//! ## Frame cycle
//!
//! ```text
//! edit layers -> validate -> accept_changes -> (render client target) -> present
//! ```
//!
//! A session never blocks on the display, except where a fence of the previous frame
//! has to be waited on before its buffers can be reused.
//!
//! ### Logging
//!
//! This crate makes extensive use of [`tracing`] for its internal logging. Every session
//! carries a span naming its display, so log lines of multiple displays can be told apart.
//!
//! For release builds it is recommended to limit the log level during compile time,
//! by enabling the `release_max_level_*` features of [`tracing`] in your binary crate.

pub mod buffer;
pub mod capture;
pub mod color;
pub mod config;
pub mod context;
pub mod engine;
pub mod layer;
pub mod notify;
pub mod session;
pub mod sync;
pub mod utils;
