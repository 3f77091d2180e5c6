// Copyright 2024-Present Crossbar contributors
// SPDX-License-Identifier: Apache-2.0

//! External-module bridge: exposes the in-process message bus to
//! out-of-process scripts and plugins over bidirectional byte streams
//! (stdio pipes of spawned children, or accepted TCP/UNIX sockets),
//! multiplexing RPC, handler installation and message watching through
//! one textual protocol.
//!
//! Unix only: the spawned-script path needs fork/exec semantics, audio
//! descriptor inheritance and `waitpid`.

#![cfg(unix)]

pub mod bridge;
pub mod chan;
pub mod listener;
pub mod module;
pub mod protocol;
pub mod stream;

mod spawn;

pub use bridge::{Bridge, Role};
pub use chan::{connect_endpoints, disconnect_endpoint, CallEndpoint, EndpointRef, ExtModChan};
pub use module::ExtModule;
