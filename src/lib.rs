//! # Tutti
//!
//! A peer-to-peer message plane for real-time interactive music and media
//! systems. Processes join a named *ensemble*, discover each other over UDP
//! broadcast (or through an explicit hub), advertise named *services*, and
//! exchange typed, optionally timestamped messages addressed by OSC-style
//! hierarchical paths such as `/synth/lfo/freq`.
//!
//! Every ensemble runs a distributed clock-synchronization protocol, so a
//! message timestamped for the future fires at a well-defined global time on
//! whichever peer provides the addressed service.
//!
//! ## Architecture
//!
//! - **Addressing**: a full-path hash table for literal addresses plus a tree
//!   of hash nodes for pattern matching (`*`, `?`, `[set]`, `{a,b}`), with
//!   *taps* that forward copies of a service's traffic to another service.
//! - **Discovery**: round-robin UDP broadcast over a fixed 16-port list, or
//!   hub-based bootstrap; peers keep one TCP control channel per pair.
//! - **Clock**: one reference process exports the ensemble clock; followers
//!   track it with a min-round-trip filter and rate-limited slewing.
//! - **Scheduling**: two 128-bin timing wheels (local time and global time)
//!   dispatch timestamped messages in order.
//!
//! The core is single-threaded and cooperative: everything happens inside
//! [`Ensemble::poll`]. A companion thread (an audio callback, say) can hand
//! messages in through the lock-free [`Injector`].

pub mod args;
pub mod builder;
pub mod ensemble;
pub mod error;
pub mod handoff;
pub mod message;
pub mod pattern;
pub mod time;

pub(crate) mod clock;
pub(crate) mod discovery;
pub(crate) mod dispatch;
pub(crate) mod key;
pub(crate) mod net;
pub(crate) mod path;
pub(crate) mod proc;
pub(crate) mod sched;
pub(crate) mod send;
mod services;

pub use args::{Arg, ArgReader, VecArg};
pub use builder::MsgBuilder;
pub use ensemble::{Ensemble, Options, ServiceInfo, ServiceKind};
pub use error::{CanSend, Error, Result, Status};
pub use handoff::Injector;
pub use message::{Msg, MsgData};
pub use path::HandlerFn;
pub use services::TapMode;
pub use time::{ManualTimeProvider, SystemTimeProvider, TimeProvider};

/// Crate version, as reported by [`Ensemble::version`].
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Largest accepted message, on the wire and in memory (bytes).
pub const MAX_MSG_SIZE: usize = 32 * 1024;
