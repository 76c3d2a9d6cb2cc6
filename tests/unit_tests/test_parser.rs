// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use http_pool_rs::client::parser::Parser;

#[test]
fn reset_bumps_generation_and_clears_scratch() {
    let mut p = Parser::new();
    assert_eq!(p.generation(), 0);

    p.scratch_mut().extend_from_slice(b"HTTP/1.1 200 OK\r\n");
    assert!(!p.scratch_mut().is_empty());

    p.reset();
    assert_eq!(p.generation(), 1);
    assert!(p.scratch_mut().is_empty());
}

#[test]
fn reset_keeps_the_allocation() {
    let mut p = Parser::default();
    p.scratch_mut().extend_from_slice(&[0u8; 1024]);
    let cap_before = p.scratch_mut().capacity();
    p.reset();
    assert!(p.scratch_mut().capacity() >= cap_before);
}
