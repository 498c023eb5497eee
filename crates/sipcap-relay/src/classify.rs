// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Heuristic SIP classifier.
//!
//! Scans raw packet bytes for SIP header lines without parsing the IP,
//! transport or SIP layers. Lines break on CRLF; at every line start the
//! scanner looks for:
//! - `Call-ID: ` or its compact form `i:` (the packet belongs to a dialogue)
//! - `CSeq: ` followed by a method token (housekeeping methods are excluded)
//!
//! A packet is interesting when it carries a Call-ID and its CSeq method is
//! not excluded. ACKs and other continuations without a CSeq line keep the
//! default "interesting method" verdict.

use std::collections::HashSet;

const CR: u8 = 0x0D;
const LF: u8 = 0x0A;

const CALL_ID_PREFIX: &[u8] = b"Call-ID: ";
const CALL_ID_COMPACT_PREFIX: &[u8] = b"i:";
const CSEQ_PREFIX: &[u8] = b"CSeq: ";

/// Longest method token extracted from a CSeq line.
pub const MAX_METHOD_LEN: usize = 63;

/// Methods excluded by default (registration, capability probing, events).
pub const DEFAULT_EXCLUDED_METHODS: [&str; 4] = ["REGISTER", "OPTIONS", "NOTIFY", "SUBSCRIBE"];

/// Outcome of classifying one payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassificationVerdict {
    /// A `Call-ID:`/`i:` line was found.
    pub has_call_id: bool,
    /// No CSeq line named an excluded method.
    pub has_interesting_method: bool,
}

impl ClassificationVerdict {
    pub fn is_interesting(&self) -> bool {
        self.has_call_id && self.has_interesting_method
    }
}

impl Default for ClassificationVerdict {
    fn default() -> Self {
        Self {
            has_call_id: false,
            has_interesting_method: true,
        }
    }
}

/// Line automaton state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    ScanningBody,
    SawCarriageReturn,
    AtLineStart,
}

/// Bounds of a scan over a payload.
///
/// The window stops two bytes short of the payload end, so look-ahead at a
/// line start never needs a length check against the real end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ScanWindow {
    position: usize,
    end: usize,
}

impl ScanWindow {
    fn new(payload_len: usize) -> Self {
        Self {
            position: 0,
            end: payload_len.saturating_sub(2),
        }
    }

    fn has_more(&self) -> bool {
        self.position < self.end
    }

    fn remaining(&self) -> usize {
        self.end.saturating_sub(self.position)
    }

    /// Does the window at `position` start with `prefix`?
    ///
    /// Comparison is case-insensitive and bounded by
    /// `min(prefix.len(), remaining())`, so a prefix cut by the window end
    /// still matches on its visible part.
    fn starts_with(&self, payload: &[u8], prefix: &[u8]) -> bool {
        let n = prefix.len().min(self.remaining());
        payload[self.position..self.position + n].eq_ignore_ascii_case(&prefix[..n])
    }

    /// Index of the next CR inside the window, starting at `position`.
    fn find_cr(&self, payload: &[u8]) -> Option<usize> {
        payload[self.position..self.end]
            .iter()
            .position(|&b| b == CR)
            .map(|i| self.position + i)
    }
}

/// SIP packet classifier.
#[derive(Debug, Clone)]
pub struct Classifier {
    excluded_methods: HashSet<String>,
}

impl Classifier {
    /// Create a classifier with the given excluded CSeq methods.
    pub fn new<I, S>(excluded_methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            excluded_methods: excluded_methods
                .into_iter()
                .map(|m| m.into().to_ascii_uppercase())
                .collect(),
        }
    }

    /// Excluded methods (upper-cased).
    pub fn excluded_methods(&self) -> &HashSet<String> {
        &self.excluded_methods
    }

    /// Shorthand for `classify(payload).is_interesting()`.
    pub fn is_interesting(&self, payload: &[u8]) -> bool {
        self.classify(payload).is_interesting()
    }

    /// Scan `payload` and produce a verdict.
    pub fn classify(&self, payload: &[u8]) -> ClassificationVerdict {
        let mut verdict = ClassificationVerdict::default();
        let mut window = ScanWindow::new(payload.len());
        let mut state = ScanState::ScanningBody;
        let mut cseq_seen = false;

        while window.has_more() {
            let byte = payload[window.position];
            match state {
                ScanState::ScanningBody => {
                    if byte == CR {
                        state = ScanState::SawCarriageReturn;
                    }
                }
                ScanState::SawCarriageReturn => {
                    state = if byte == LF {
                        ScanState::AtLineStart
                    } else {
                        ScanState::ScanningBody
                    };
                }
                ScanState::AtLineStart => {
                    state = ScanState::ScanningBody;
                    if window.starts_with(payload, CALL_ID_PREFIX)
                        || window.starts_with(payload, CALL_ID_COMPACT_PREFIX)
                    {
                        verdict.has_call_id = true;
                    } else if !cseq_seen && window.starts_with(payload, CSEQ_PREFIX) {
                        cseq_seen = true;
                        if let Some(method) = self.extract_method(payload, &mut window) {
                            if self.is_excluded(method) {
                                verdict.has_interesting_method = false;
                            }
                        }
                        // Resume on the method token; the line's CR is still ahead.
                        continue;
                    }
                }
            }
            window.position += 1;
        }

        verdict
    }

    /// Pull the method token out of a CSeq line.
    ///
    /// On entry the window sits on the `CSeq: ` prefix. On exit it sits on the
    /// first byte not consumed by the extraction, and the automaton is back in
    /// body-scanning mode. Returns `None` when the line has no CR before the
    /// window end or carries no alphabetic token.
    fn extract_method<'a>(&self, payload: &'a [u8], window: &mut ScanWindow) -> Option<&'a [u8]> {
        window.position = (window.position + CSEQ_PREFIX.len()).min(window.end);
        if !window.has_more() {
            return None;
        }

        // Truncated or garbled line: abandon, keep the default verdict.
        let cr = window.find_cr(payload)?;

        while window.position < cr && !payload[window.position].is_ascii_alphabetic() {
            window.position += 1;
        }

        let start = window.position;
        let limit = cr.min(start + MAX_METHOD_LEN);
        let len = payload[start..limit]
            .iter()
            .take_while(|b| b.is_ascii_alphabetic())
            .count();

        if len == 0 {
            return None;
        }
        Some(&payload[start..start + len])
    }

    /// Compare a method token against the excluded set.
    ///
    /// The comparison is bounded by the token's own length, so a token cut
    /// short (`REG`) still matches its excluded method.
    fn is_excluded(&self, method: &[u8]) -> bool {
        self.excluded_methods.iter().any(|excluded| {
            let excluded = excluded.as_bytes();
            method.len() <= excluded.len() && excluded[..method.len()].eq_ignore_ascii_case(method)
        })
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(DEFAULT_EXCLUDED_METHODS)
    }
}
