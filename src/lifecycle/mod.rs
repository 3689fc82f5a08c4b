//! Start/stop discipline for long-lived resources
//!
//! Every listener and every supervisor slot mints a new [`Generation`] on
//! start. Background work captures the value it was started with and only
//! commits state while that value is still current, so a late completion
//! from a superseded start can never overwrite newer state.

mod generation;
mod listener;

pub use generation::Generation;
pub use listener::ManagedListener;
