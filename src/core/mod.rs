//! Turn orchestration
//!
//! Ties the session, the completion provider and the history store together
//! for one user message at a time.

mod turn;

pub use turn::{ChannelSink, TurnController};
