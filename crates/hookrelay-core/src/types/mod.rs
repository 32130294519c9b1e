//! Core types for hookrelay.

mod delivery;
mod event;
mod subscription;

pub use delivery::*;
pub use event::*;
pub use subscription::*;
