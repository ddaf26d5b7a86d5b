//! # Messages and Dispatch
//!
//! Decoded [`message::Message`]s travel from connection pipelines through the
//! process-wide [`queue::MessageQueue`] into the [`dispatcher::Dispatcher`],
//! which routes them to handlers by `(scheme, tag, type)`.

pub mod dispatcher;
pub mod message;
pub mod queue;
