// Copyright 2024-Present Crossbar contributors
// SPDX-License-Identifier: Apache-2.0

//! Variable-size byte buffer with an over-allocation hint. Every
//! mutation funnels through [`DataBlock::change`]; `cut` is its
//! symmetric inverse. Allocation sizes round up to 8-byte multiples and
//! honour the hint, so short appends (the common case for audio frames
//! and line buffers) do not reallocate.

use base64::Engine as _;
use std::fmt;

use crate::g711;

/// Separators accepted by the hex codec when asked to guess.
const HEX_SEPARATORS: &[u8] = b" :;.,-/|";

/// Result codes of [`DataBlock::change_hex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HexError {
    #[error("invalid hexadecimal digit or separator")]
    InvalidChar,
    #[error("invalid hexadecimal string length")]
    InvalidLength,
}

#[derive(Default, Clone)]
pub struct DataBlock {
    buf: Vec<u8>,
    over_alloc: usize,
}

impl DataBlock {
    pub fn new() -> Self {
        DataBlock::default()
    }

    /// An empty block that will over-allocate by `over_alloc` bytes on
    /// every growth, trading memory for fewer reallocations.
    pub fn with_over_alloc(over_alloc: usize) -> Self {
        DataBlock {
            buf: Vec::new(),
            over_alloc,
        }
    }

    /// A zero-filled block of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        DataBlock {
            buf: vec![0; len],
            over_alloc: 0,
        }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        DataBlock {
            buf: data.to_vec(),
            over_alloc: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes currently reserved; never below `len()`.
    pub fn allocated(&self) -> usize {
        self.buf.capacity()
    }

    pub fn over_alloc(&self) -> usize {
        self.over_alloc
    }

    pub fn set_over_alloc(&mut self, over_alloc: usize) {
        self.over_alloc = over_alloc;
    }

    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn clear(&mut self) {
        self.buf = Vec::new();
    }

    /// Allocation size for `len` held bytes: hint added, rounded up to
    /// the next multiple of 8.
    fn alloc_len(&self, len: usize) -> usize {
        (len + self.over_alloc + 7) & !7
    }

    /// The single mutating primitive: insert `buf` at `pos` (clamped to
    /// the current length) followed by `extra` bytes of `fill`.
    /// Everything else (append, insert, resize) is expressed through it.
    pub fn change(&mut self, pos: usize, buf: &[u8], extra: usize, fill: u8) {
        let added = buf.len() + extra;
        if added == 0 {
            return;
        }
        let pos = pos.min(self.buf.len());
        let new_len = self.buf.len() + added;
        if new_len > self.buf.capacity() {
            let target = self.alloc_len(new_len);
            self.buf.reserve_exact(target - self.buf.len());
        }
        self.buf.splice(
            pos..pos,
            buf.iter().copied().chain(std::iter::repeat(fill).take(extra)),
        );
    }

    pub fn assign(&mut self, data: &[u8]) {
        self.buf.clear();
        self.change(0, data, 0, 0);
    }

    pub fn append(&mut self, data: &[u8]) {
        self.change(self.buf.len(), data, 0, 0);
    }

    pub fn append_bytes(&mut self, count: usize, fill: u8) {
        self.change(self.buf.len(), &[], count, fill);
    }

    pub fn insert(&mut self, pos: usize, data: &[u8]) {
        self.change(pos, data, 0, 0);
    }

    /// Grow with zero fill or shrink from the tail to exactly `len`.
    pub fn resize(&mut self, len: usize) {
        if len > self.buf.len() {
            self.append_bytes(len - self.buf.len(), 0);
        } else if len < self.buf.len() {
            let cut_len = self.buf.len() - len;
            self.cut(len, cut_len, true);
        }
    }

    /// Remove `len` bytes starting at `pos`; both are clamped. With
    /// `realloc` the reservation shrinks back to the rounded size.
    pub fn cut(&mut self, pos: usize, len: usize, realloc: bool) {
        if len == 0 || pos >= self.buf.len() {
            return;
        }
        let len = len.min(self.buf.len() - pos);
        self.buf.drain(pos..pos + len);
        if self.buf.is_empty() {
            self.clear();
        } else if realloc {
            let target = self.alloc_len(self.buf.len());
            self.buf.shrink_to(target);
        }
    }

    /// Hexadecimal rendering, optionally with one separator between
    /// octets.
    pub fn hexify(&self, sep: Option<char>) -> String {
        let mut out = String::with_capacity(self.buf.len() * 3);
        for (i, b) in self.buf.iter().enumerate() {
            if i > 0 {
                if let Some(sep) = sep {
                    out.push(sep);
                }
            }
            out.push_str(&format!("{b:02x}"));
        }
        out
    }

    /// Decode a hexadecimal string and insert the octets at `pos`.
    ///
    /// Each octet takes exactly two digits. When a separator is in use
    /// (given, or guessed from `" :;.,-/|"`), exactly one must sit
    /// between octet pairs, and at most one may lead or trail. Returns
    /// the number of octets inserted; the block is untouched on error.
    pub fn change_hex(
        &mut self,
        pos: usize,
        text: &str,
        sep: Option<char>,
        guess_sep: bool,
        empty_ok: bool,
    ) -> Result<usize, HexError> {
        let mut data = text.as_bytes();
        if data.is_empty() {
            return if empty_ok { Ok(0) } else { Err(HexError::InvalidLength) };
        }

        let mut sep = sep.map(|c| c as u8);
        if sep.is_none() && guess_sep && data.len() > 2 {
            for &cand in HEX_SEPARATORS {
                let offs = if data[0] == cand { 3 } else { 2 };
                if data.len() == offs || data[offs] == cand {
                    sep = Some(cand);
                    break;
                }
            }
        }

        let count = match sep {
            None => {
                if data.len() % 2 != 0 {
                    return Err(HexError::InvalidLength);
                }
                data.len() / 2
            }
            Some(sep_byte) => {
                if data[0] == sep_byte {
                    data = &data[1..];
                }
                if let [rest @ .., last] = data {
                    if *last == sep_byte {
                        data = rest;
                    }
                }
                if data.is_empty() {
                    return if empty_ok { Ok(0) } else { Err(HexError::InvalidLength) };
                }
                if data.len() % 3 != 2 {
                    return Err(HexError::InvalidLength);
                }
                (data.len() + 1) / 3
            }
        };
        if count == 0 {
            return if empty_ok { Ok(0) } else { Err(HexError::InvalidLength) };
        }

        let step = if sep.is_some() { 3 } else { 2 };
        let mut decoded = Vec::with_capacity(count);
        let mut i = 0;
        while i < data.len() {
            let hi = hex_digit(data[i]).ok_or(HexError::InvalidChar)?;
            let lo = hex_digit(data[i + 1]).ok_or(HexError::InvalidChar)?;
            if let Some(sep_byte) = sep {
                if decoded.len() != count - 1 && data[i + 2] != sep_byte {
                    return Err(HexError::InvalidChar);
                }
            }
            decoded.push((hi << 4) | lo);
            i += step;
        }
        self.change(pos, &decoded, 0, 0);
        Ok(count)
    }

    /// Whole-string hex decode into a fresh block.
    pub fn from_hex(text: &str, sep: Option<char>) -> Result<DataBlock, HexError> {
        let mut block = DataBlock::new();
        block.change_hex(0, text, sep, sep.is_none(), true)?;
        Ok(block)
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.buf)
    }

    pub fn from_base64(text: &str) -> Result<DataBlock, base64::DecodeError> {
        let buf = base64::engine::general_purpose::STANDARD.decode(text)?;
        Ok(DataBlock { buf, over_alloc: 0 })
    }

    /// Transcode `src` between `slin` (16-bit native-endian linear PCM),
    /// `alaw` and `mulaw`. `max_len` of 0 converts everything; `None`
    /// means the format pair is not supported.
    pub fn convert(src: &DataBlock, sformat: &str, dformat: &str, max_len: usize) -> Option<DataBlock> {
        if sformat == dformat {
            return Some(src.clone());
        }
        let mut len = src.len();
        if max_len != 0 && max_len < len {
            len = max_len;
        }
        let data = &src.data()[..len];
        let t = g711::tables();
        let buf = match (sformat, dformat) {
            ("slin", "alaw") => encode_lin(data, &t.lin_to_alaw),
            ("slin", "mulaw") => encode_lin(data, &t.lin_to_mulaw),
            ("alaw", "slin") => decode_lin(data, &t.alaw_to_lin),
            ("mulaw", "slin") => decode_lin(data, &t.mulaw_to_lin),
            ("alaw", "mulaw") => data.iter().map(|&b| t.alaw_to_mulaw[b as usize]).collect(),
            ("mulaw", "alaw") => data.iter().map(|&b| t.mulaw_to_alaw[b as usize]).collect(),
            _ => return None,
        };
        Some(DataBlock { buf, over_alloc: 0 })
    }
}

fn encode_lin(data: &[u8], table: &[u8; 65536]) -> Vec<u8> {
    data.chunks_exact(2)
        .map(|pair| {
            let sample = u16::from_ne_bytes([pair[0], pair[1]]);
            table[sample as usize]
        })
        .collect()
}

fn decode_lin(data: &[u8], table: &[i16; 256]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() * 2);
    for &b in data {
        out.extend_from_slice(&table[b as usize].to_ne_bytes());
    }
    out
}

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

impl fmt::Debug for DataBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataBlock")
            .field("len", &self.buf.len())
            .field("allocated", &self.buf.capacity())
            .finish()
    }
}

impl PartialEq for DataBlock {
    fn eq(&self, other: &Self) -> bool {
        self.buf == other.buf
    }
}

impl Eq for DataBlock {}
