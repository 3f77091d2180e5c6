// Copyright 2024-Present Crossbar contributors
// SPDX-License-Identifier: Apache-2.0

//! Listener threads accepting TCP or UNIX connections and handing each
//! accepted socket to a new bridge in the configured role.

use std::net::TcpListener;
use std::os::unix::net::UnixListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use anyhow::{bail, Context as _};
use tracing::{info, warn};

use crossbar_core::namedlist::NamedList;
use crossbar_core::sync::idle;

use crate::bridge::{Bridge, Role};
use crate::module::ExtModule;
use crate::stream::{tcp_halves, unix_halves};

enum ListenSocket {
    Tcp(TcpListener),
    Unix(UnixListener),
}

pub(crate) struct ExtListener {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ExtListener {
    /// Bind and start a listener from a `[listener <name>]` section.
    pub(crate) fn build(
        module: &Arc<ExtModule>,
        name: &str,
        sect: &NamedList,
    ) -> anyhow::Result<ExtListener> {
        let role = match sect.get_value("role", "") {
            "" => Role::Unknown,
            "global" => Role::Global,
            "channel" => Role::Channel,
            other => bail!("unknown role '{other}' of listener '{name}'"),
        };
        let socket = match sect.get_value("type", "") {
            "unix" => {
                let path = sect.get_value("path", "");
                if path.is_empty() {
                    bail!("missing path of listener '{name}'");
                }
                let _ = std::fs::remove_file(path);
                let listener = UnixListener::bind(path)
                    .with_context(|| format!("could not bind listener '{name}' to '{path}'"))?;
                listener.set_nonblocking(true)?;
                ListenSocket::Unix(listener)
            }
            "tcp" => {
                let host = sect.get_value("addr", "127.0.0.1");
                let port = sect.get_int_value("port", 0);
                if host.is_empty() || port <= 0 || port > 65535 {
                    bail!("missing or invalid address of listener '{name}'");
                }
                let listener = TcpListener::bind((host, port as u16))
                    .with_context(|| format!("could not bind listener '{name}'"))?;
                listener.set_nonblocking(true)?;
                ListenSocket::Tcp(listener)
            }
            "" => bail!("missing type of listener '{name}'"),
            other => bail!("unknown type '{other}' of listener '{name}'"),
        };

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let thread_name = name.to_owned();
        let weak_module = Arc::downgrade(module);
        let handle = std::thread::Builder::new()
            .name("ExtMod Listener".into())
            .spawn(move || accept_loop(socket, thread_name, role, weak_module, thread_stop))
            .context("could not start listener thread")?;
        Ok(ExtListener {
            stop,
            handle: Some(handle),
        })
    }

    /// Ask the thread to stop and wait for it.
    pub(crate) fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn accept_loop(
    socket: ListenSocket,
    name: String,
    role: Role,
    module: Weak<ExtModule>,
    stop: Arc<AtomicBool>,
) {
    loop {
        idle();
        if stop.load(Ordering::Acquire) {
            break;
        }
        let Some(module) = module.upgrade() else {
            break;
        };
        if module.engine().exiting() {
            break;
        }
        let accepted = match &socket {
            ListenSocket::Tcp(listener) => match listener.accept() {
                Ok((stream, addr)) => {
                    let conn = addr.to_string();
                    tcp_halves(stream).map(|io| (io, conn))
                }
                Err(e) => Err(e),
            },
            ListenSocket::Unix(listener) => match listener.accept() {
                Ok((stream, _)) => {
                    let conn = format!("unix:{name}");
                    unix_halves(stream).map(|io| (io, conn))
                }
                Err(e) => Err(e),
            },
        };
        match accepted {
            Ok((io, conn)) => {
                info!("listener '{name}' got connection from '{conn}'");
                Bridge::build_stream(&module, &name, io, None, role, &conn);
            }
            Err(e) if crate::stream::retryable(&e) => {}
            Err(e) => {
                module.engine().alarm(
                    "socket",
                    &format!("error on accept(), shutting down ExtListener '{name}': {e}"),
                );
                break;
            }
        }
    }
    warn!("listener '{name}' stopped");
}
