//! Akari - the control core of a meme image bot
//!
//! Inbound posts are routed by [`intake`]: timeline posts become candidates
//! in a durable [`queue`], posts addressed to the bot become interactive
//! requests. A [`dispatch`] cycle ranks the queue with [`scoring`], composes
//! the best candidate through a bounded retry policy ([`compose`]), gated by
//! a persistent [`ratelimit`], and publishes the result with a [`post`]er.

pub mod compose;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod intake;
pub mod post;
pub mod queue;
pub mod ratelimit;
pub mod scoring;
pub mod search;
pub mod shutdown;
pub mod text;

pub use error::{AkariError, Result};
