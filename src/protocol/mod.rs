//! Wire protocol and type-routed dispatch.
//!
//! Frames are JSON objects (see [`Message`]). The `type` field selects a
//! [`Handler`] from the [`HandlerRegistry`]; `method` tells requests from
//! responses. The [`Dispatcher`] drains a bounded inbound queue with a fixed
//! worker pool, so responses leave in completion order, not arrival order.

pub mod dispatcher;
pub mod message;

pub use dispatcher::{dispatch, Context, Dispatcher, Handler, HandlerRegistry};
pub use message::{types, Message, Method, ResponseCode};
