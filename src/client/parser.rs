// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::BytesMut;

/// Reusable response-parser state parked on a connection.
///
/// The pool does not interpret HTTP itself; it only keeps one parser
/// instance alive per connection so the message layer can reuse its
/// scratch allocations across sequential responses. Only the
/// transaction currently holding the read side can reach it.
#[derive(Debug)]
pub struct Parser {
    scratch: BytesMut,
    generation: u64,
}

impl Parser {
    const SCRATCH_CAPACITY: usize = 16 * 1024;

    pub fn new() -> Self {
        Self {
            scratch: BytesMut::with_capacity(Self::SCRATCH_CAPACITY),
            generation: 0,
        }
    }

    /// Prepares the parser for the next response. Keeps the scratch
    /// allocation, bumps the generation counter.
    pub fn reset(&mut self) {
        self.scratch.clear();
        self.generation += 1;
    }

    /// Scratch space for the message layer to accumulate header bytes.
    pub fn scratch_mut(&mut self) -> &mut BytesMut {
        &mut self.scratch
    }

    /// How many times this parser instance has been handed out for a
    /// fresh response on its connection.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}
