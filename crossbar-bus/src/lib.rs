// Copyright 2024-Present Crossbar contributors
// SPDX-License-Identifier: Apache-2.0

//! The in-process message bus: messages with ordered parameters and a
//! single-line wire codec, prioritised handlers with optional parameter
//! filters, relays that trampoline into receivers, post-dispatch hooks,
//! and the engine that dispatches synchronously or from queue workers.

pub mod engine;
pub mod handler;
pub mod message;

pub use engine::Engine;
pub use handler::{
    FilterValue, MessageFilter, MessageHandler, MessagePostHook, MessageReceiver, MessageRelay,
};
pub use message::{Message, WireMessage};
