// Copyright 2024-Present Crossbar contributors
// SPDX-License-Identifier: Apache-2.0

//! Runtime primitives shared by the engine: the variable byte buffer with
//! its companding codecs, ordered name/value lists and in-memory
//! configuration, wire escaping, and the small locking helpers the
//! blocking-thread model is built on.

pub mod atom;
pub mod config;
pub mod datablock;
pub mod escape;
pub mod g711;
pub mod namedlist;
pub mod sync;

pub use config::Configuration;
pub use datablock::DataBlock;
pub use namedlist::NamedList;
