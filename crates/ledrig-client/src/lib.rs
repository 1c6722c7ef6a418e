//! Client library for LED rigs.
//!
//! [`DeviceController`] owns the active transport and the event stream;
//! [`AnimationManager`] plays [`Pattern`]s through it.

pub mod animation;
pub mod controller;
pub mod pattern;
pub mod project;

pub use animation::{AnimationError, AnimationEvent, AnimationManager, PlaybackState, SessionStatus};
pub use controller::{
    ConnectError, ConnectionState, DeviceController, Event, EventStream, SendError, SentCommand,
};
pub use pattern::{Pattern, Step};
pub use project::{Project, ProjectError};

pub use ledrig_hw::{Color, Command, DeviceEvent, TransportConfig};
