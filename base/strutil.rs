// This file is part of pvr-dvr, a personal video recorder backend.
// Copyright (C) 2024 The pvr-dvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use std::fmt::Write as _;

static MULTIPLIERS: [(char, u64); 4] = [
    // (suffix character, power of 2)
    ('T', 40),
    ('G', 30),
    ('M', 20),
    ('K', 10),
];

/// Encodes a non-negative size into human-readable form.
pub fn encode_size(mut raw: i64) -> String {
    let mut encoded = String::new();
    for &(c, n) in &MULTIPLIERS {
        if raw >= 1i64 << n {
            let _ = write!(&mut encoded, "{}{} ", raw >> n, c);
            raw &= (1i64 << n) - 1;
        }
    }
    if raw > 0 || encoded.is_empty() {
        let _ = write!(&mut encoded, "{raw}");
    } else {
        encoded.pop(); // remove trailing space.
    }
    encoded
}

/// Turns arbitrary text (eg a programme title) into a single safe path component.
///
/// Path separators and control characters become `-`, leading dots are dropped so the
/// result is never hidden or `..`, and an empty result becomes `_`.
pub fn clean_path_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '/' | '\\' | ':' | '\0' => out.push('-'),
            c if c.is_control() => out.push('-'),
            '.' if out.is_empty() => {}
            c => out.push(c),
        }
    }
    let trimmed = out.trim();
    if trimmed.is_empty() {
        "_".to_owned()
    } else {
        trimmed.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode() {
        assert_eq!(encode_size(0), "0");
        assert_eq!(encode_size(100i64 << 20), "100M");
        assert_eq!(encode_size((1i64 << 30) + 42), "1G 42");
    }

    #[test]
    fn clean() {
        assert_eq!(clean_path_component("News at 10"), "News at 10");
        assert_eq!(clean_path_component("A/B: C"), "A-B- C");
        assert_eq!(clean_path_component("../etc"), "-etc");
        assert_eq!(clean_path_component("..."), "_");
        assert_eq!(clean_path_component("\tx\n"), "-x-");
    }
}
