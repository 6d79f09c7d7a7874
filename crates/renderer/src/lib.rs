//! Frame presentation on top of the cadence submission layer.
//!
//! This crate cycles a small fixed set of frame slots between the caller,
//! the device and the display surface:
//! - [`Frame`] - render target plus its synchronization signals
//! - [`PresentationCycle`] - hands out slots, copies and presents them
//! - [`FrameManager`] - one call per frame, skipping frames on transient errors

pub mod frame;
pub mod frame_manager;
pub mod presentation;

pub use frame::Frame;
pub use frame_manager::{FrameManager, FrameOutcome, FrameStats};
pub use presentation::PresentationCycle;

/// Number of frame slots a presentation cycle holds by default.
///
/// Two slots let the CPU record frame N+1 while the device renders frame N.
pub const FRAMES_IN_FLIGHT: usize = 2;
