//! Incremental crash signature detector
//!
//! The detector sits between the child's stderr and this process's stderr.
//! Bytes are fed in whatever chunks the pipe delivers (down to a single
//! byte). Ordinary output is handed back for pass-through as soon as it can
//! no longer be the start of a signature; once a signature matches at the
//! start of a line, everything from the signature on is kept as the capture.
//!
//! Phases:
//! - `Scanning`: nothing pending
//! - `PartialMatch`: the bytes held since the last line start are a prefix
//!   of at least one signature
//! - `Capturing`: a signature matched; all further bytes go to the capture
//! - `Confirmed`: the capture is final (stream closed or quiet period)
//!
//! The detector does no I/O and keeps no clock. The forwarder decides when
//! a pending match has waited long enough and calls [`Detector::expire`].

/// Line prefixes that start a crash dump, in match priority order
///
/// Covers the Rust runtime (panics, stack overflow, allocation failure)
/// plus the generic `panic:` / `fatal error:` headers printed by other
/// runtimes.
pub const DEFAULT_SIGNATURES: &[&str] = &[
    "thread '",
    "fatal runtime error:",
    "memory allocation of ",
    "panic:",
    "fatal error:",
];

/// Detector state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Scanning,
    PartialMatch,
    Capturing,
    Confirmed,
}

/// Streaming matcher for line-start crash signatures
#[derive(Debug, Clone)]
pub struct Detector {
    signatures: Vec<Vec<u8>>,
    phase: Phase,
    /// Whether the next byte begins a line
    line_start: bool,
    /// Bytes of a pending signature prefix
    held: Vec<u8>,
    capture: Vec<u8>,
    /// Index into `signatures` of the match
    matched: Option<usize>,
    capture_taken: bool,
}

impl Detector {
    /// Create a detector for the given signatures
    ///
    /// Empty signatures are ignored.
    pub fn new<I, S>(signatures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        Self {
            signatures: signatures
                .into_iter()
                .map(|s| s.as_ref().to_vec())
                .filter(|s| !s.is_empty())
                .collect(),
            phase: Phase::Scanning,
            line_start: true,
            held: Vec::new(),
            capture: Vec::new(),
            matched: None,
            capture_taken: false,
        }
    }

    /// Create a detector for [`DEFAULT_SIGNATURES`]
    pub fn with_default_signatures() -> Self {
        Self::new(DEFAULT_SIGNATURES)
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The signature that started the capture, if any
    pub fn matched_signature(&self) -> Option<&[u8]> {
        self.matched.map(|i| self.signatures[i].as_slice())
    }

    /// Bytes currently held back as a possible signature start
    pub fn held(&self) -> &[u8] {
        &self.held
    }

    /// Number of bytes captured so far
    pub fn captured_len(&self) -> usize {
        self.capture.len()
    }

    /// Feed a chunk of stream data
    ///
    /// Bytes that are safe to pass through are appended to `out`.
    pub fn feed(&mut self, mut chunk: &[u8], out: &mut Vec<u8>) {
        while !chunk.is_empty() {
            match self.phase {
                Phase::Capturing => {
                    self.capture.extend_from_slice(chunk);
                    return;
                }
                Phase::Confirmed => {
                    out.extend_from_slice(chunk);
                    return;
                }
                Phase::Scanning if !self.line_start => {
                    // Fast path to the end of the current line
                    match chunk.iter().position(|&b| b == b'\n') {
                        Some(i) => {
                            out.extend_from_slice(&chunk[..=i]);
                            chunk = &chunk[i + 1..];
                            self.line_start = true;
                        }
                        None => {
                            out.extend_from_slice(chunk);
                            return;
                        }
                    }
                }
                Phase::Scanning | Phase::PartialMatch => {
                    let byte = chunk[0];
                    chunk = &chunk[1..];
                    self.step(byte, out);
                }
            }
        }
    }

    /// Advance the line-start match by one byte
    fn step(&mut self, byte: u8, out: &mut Vec<u8>) {
        self.held.push(byte);

        let mut pending = false;
        for (index, signature) in self.signatures.iter().enumerate() {
            if !signature.starts_with(&self.held) {
                continue;
            }
            if signature.len() == self.held.len() {
                self.matched = Some(index);
                self.capture = std::mem::take(&mut self.held);
                self.phase = Phase::Capturing;
                return;
            }
            pending = true;
        }

        if pending {
            self.phase = Phase::PartialMatch;
        } else {
            self.disprove(out);
        }
    }

    /// Release a failed match, rescanning everything after its first byte
    fn disprove(&mut self, out: &mut Vec<u8>) {
        let held = std::mem::take(&mut self.held);
        self.phase = Phase::Scanning;
        let (first, rest) = match held.split_first() {
            Some(split) => split,
            None => return,
        };
        out.push(*first);
        self.line_start = *first == b'\n';
        self.feed(rest, out);
    }

    /// Release held bytes as ordinary output
    fn release(&mut self, out: &mut Vec<u8>) {
        if let Some(&last) = self.held.last() {
            self.line_start = last == b'\n';
        }
        out.append(&mut self.held);
        self.phase = Phase::Scanning;
    }

    /// The armed timer ran out without new bytes
    ///
    /// A pending partial match is abandoned and its bytes released to
    /// `out`. A running capture is promoted to `Confirmed`; later bytes pass
    /// through untouched.
    pub fn expire(&mut self, out: &mut Vec<u8>) {
        match self.phase {
            Phase::PartialMatch => self.release(out),
            Phase::Capturing => self.phase = Phase::Confirmed,
            Phase::Scanning | Phase::Confirmed => {}
        }
    }

    /// The stream closed
    ///
    /// Releases any pending partial match to `out` and returns the capture
    /// if a signature matched.
    pub fn finish(&mut self, out: &mut Vec<u8>) -> Option<Vec<u8>> {
        match self.phase {
            Phase::PartialMatch => self.release(out),
            Phase::Capturing => self.phase = Phase::Confirmed,
            Phase::Scanning | Phase::Confirmed => {}
        }
        self.take_capture()
    }

    /// Hand out the confirmed capture
    ///
    /// Returns `Some` at most once per detector, and only after the capture
    /// reached `Confirmed`.
    pub fn take_capture(&mut self) -> Option<Vec<u8>> {
        if self.phase != Phase::Confirmed || self.capture_taken {
            return None;
        }
        self.capture_taken = true;
        Some(std::mem::take(&mut self.capture))
    }
}

impl Default for Detector {
    fn default() -> Self {
        Self::with_default_signatures()
    }
}
