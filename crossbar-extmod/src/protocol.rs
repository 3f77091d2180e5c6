// Copyright 2024-Present Crossbar contributors
// SPDX-License-Identifier: Apache-2.0

//! Line classification for the external-module wire protocol and the
//! builders for the engine's confirmation lines.
//!
//! Keywords travel as `%%>word:` from the peer and are confirmed as
//! `%%<word:`. Message traffic in both directions shares the
//! `%%<message:` shape handled by [`crossbar_bus::WireMessage`].

/// One line received from a peer, classified but not yet validated
/// against the bridge state.
#[derive(Debug, PartialEq, Eq)]
pub enum PeerLine<'a> {
    /// `%%>connect:<role>[:<chanId>[:<type>]]`
    Connect {
        role: &'a str,
        chan: &'a str,
        kind: &'a str,
    },
    /// Anything starting `%%<message:`; parsed separately.
    MessageLine,
    /// `%%>install:<prio>:<name>[:<filterName>:<filterValue>]`
    Install {
        priority: u32,
        name: &'a str,
        filter: Option<(&'a str, &'a str)>,
    },
    /// `%%>uninstall:<name>`
    Uninstall { name: &'a str },
    /// `%%>watch:<name>` (empty name watches everything)
    Watch { name: &'a str },
    /// `%%>unwatch:<name>`
    Unwatch { name: &'a str },
    /// `%%>output:<text>`
    Output { text: &'a str },
    /// `%%>debug:<level>:<text>`
    Debug { level: i64, text: &'a str },
    /// `%%>setlocal:<key>:<value>` (empty value queries)
    SetLocal { key: &'a str, value: &'a str },
    /// `%%>quit`
    Quit,
    /// Unrecognized or malformed; reported back to the peer.
    Unknown,
}

impl<'a> PeerLine<'a> {
    pub fn parse(line: &'a str) -> PeerLine<'a> {
        if line.starts_with("%%<message:") {
            return PeerLine::MessageLine;
        }
        if line == "%%>quit" {
            return PeerLine::Quit;
        }
        if let Some(rest) = line.strip_prefix("%%>connect:") {
            let (role, rest) = split_field(rest);
            let (chan, kind) = split_field(rest);
            return PeerLine::Connect { role, chan, kind };
        }
        if let Some(rest) = line.strip_prefix("%%>install:") {
            let (first, rest) = split_field(rest);
            // A missing or unparsable priority keeps the default and the
            // whole remainder is the name.
            let (priority, rest) = match first.parse::<u32>() {
                Ok(p) => (p, rest),
                Err(_) => (100, if rest.is_empty() { first } else { rest }),
            };
            let (name, rest) = split_field(rest);
            let filter = if rest.is_empty() {
                None
            } else {
                let (fname, fvalue) = split_field(rest);
                Some((fname, fvalue))
            };
            return PeerLine::Install {
                priority,
                name,
                filter,
            };
        }
        if let Some(name) = line.strip_prefix("%%>uninstall:") {
            return PeerLine::Uninstall { name };
        }
        if let Some(name) = line.strip_prefix("%%>watch:") {
            return PeerLine::Watch { name };
        }
        if let Some(name) = line.strip_prefix("%%>unwatch:") {
            return PeerLine::Unwatch { name };
        }
        if let Some(text) = line.strip_prefix("%%>output:") {
            return PeerLine::Output { text };
        }
        if let Some(rest) = line.strip_prefix("%%>debug:") {
            if let Some((level, text)) = rest.split_once(':') {
                if let Ok(level) = level.parse::<i64>() {
                    return PeerLine::Debug { level, text };
                }
            }
            return PeerLine::Unknown;
        }
        if let Some(rest) = line.strip_prefix("%%>setlocal:") {
            if let Some((key, value)) = rest.split_once(':') {
                return PeerLine::SetLocal { key, value };
            }
            return PeerLine::Unknown;
        }
        PeerLine::Unknown
    }
}

/// Split at the first `:`; the second part is empty when there is none.
fn split_field(s: &str) -> (&str, &str) {
    match s.split_once(':') {
        Some((a, b)) => (a, b),
        None => (s, ""),
    }
}

pub fn connect_error(line: &str) -> String {
    format!("Error in: {line}")
}

pub fn install_reply(priority: u32, name: &str, ok: bool) -> String {
    format!("%%<install:{priority}:{name}:{ok}")
}

pub fn uninstall_reply(priority: u32, name: &str, ok: bool) -> String {
    format!("%%<uninstall:{priority}:{name}:{ok}")
}

pub fn watch_reply(name: &str, ok: bool) -> String {
    format!("%%<watch:{name}:{ok}")
}

pub fn unwatch_reply(name: &str, ok: bool) -> String {
    format!("%%<unwatch:{name}:{ok}")
}

pub fn setlocal_reply(key: &str, value: &str, ok: bool) -> String {
    format!("%%<setlocal:{key}:{value}:{ok}")
}

pub const QUIT_REPLY: &str = "%%<quit";

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn classifies_keywords() {
        assert_eq!(
            PeerLine::parse("%%>connect:global"),
            PeerLine::Connect {
                role: "global",
                chan: "",
                kind: ""
            }
        );
        assert_eq!(
            PeerLine::parse("%%>connect:channel:ext/1:playrec"),
            PeerLine::Connect {
                role: "channel",
                chan: "ext/1",
                kind: "playrec"
            }
        );
        assert_eq!(PeerLine::parse("%%>quit"), PeerLine::Quit);
        assert_eq!(PeerLine::parse("%%<message:x:0:n"), PeerLine::MessageLine);
        assert_eq!(
            PeerLine::parse("%%>setlocal:timeout:500"),
            PeerLine::SetLocal {
                key: "timeout",
                value: "500"
            }
        );
        assert_eq!(
            PeerLine::parse("%%>debug:8:some%ztext"),
            PeerLine::Debug {
                level: 8,
                text: "some%ztext"
            }
        );
        assert_eq!(PeerLine::parse("%%>debug:notanumber"), PeerLine::Unknown);
        assert_eq!(PeerLine::parse("hello there"), PeerLine::Unknown);
    }

    #[test]
    fn install_variants() {
        assert_eq!(
            PeerLine::parse("%%>install:50:engine.timer"),
            PeerLine::Install {
                priority: 50,
                name: "engine.timer",
                filter: None
            }
        );
        assert_eq!(
            PeerLine::parse("%%>install:call.route"),
            PeerLine::Install {
                priority: 100,
                name: "call.route",
                filter: None
            }
        );
        assert_eq!(
            PeerLine::parse("%%>install:10:call.execute:callto:external/nodata/x.sh"),
            PeerLine::Install {
                priority: 10,
                name: "call.execute",
                filter: Some(("callto", "external/nodata/x.sh"))
            }
        );
    }

    #[test]
    fn reply_builders() {
        assert_eq!(install_reply(50, "engine.timer", true), "%%<install:50:engine.timer:true");
        assert_eq!(uninstall_reply(0, "x", false), "%%<uninstall:0:x:false");
        assert_eq!(watch_reply("", true), "%%<watch::true");
        assert_eq!(setlocal_reply("timeout", "500", true), "%%<setlocal:timeout:500:true");
    }
}
