//! Payload extraction from raw log text.
//!
//! Every captured request shows up in the service log as a marker token immediately
//! followed by the request's JSON object. Payloads are yielded lazily and in the order
//! they appear in the file, which is the order the service originally received them.

use clap::ValueEnum;
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// How the end of a captured object is located.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStrategy {
    /// Parse forward from the opening brace until the object is complete. Handles any
    /// nesting depth, multi-line objects and trailing text after the object.
    #[default]
    Balanced,
    /// Historical shape: the remainder of the marker's line must be the object, and it
    /// must end with `}}` (a nested object closing right before the outer one). Objects
    /// ending any other way, or followed by more text on the line, are not extracted.
    Legacy,
}

impl ExtractionStrategy {
    /// Length in bytes of the object at the start of `rest`, if one can be captured.
    fn capture(self, rest: &str) -> Option<usize> {
        if !rest.starts_with('{') {
            return None;
        }

        match self {
            Self::Balanced => {
                let mut stream = serde_json::Deserializer::from_str(rest).into_iter::<IgnoredAny>();
                match stream.next() {
                    Some(Ok(_)) => Some(stream.byte_offset()),
                    _ => None,
                }
            }
            Self::Legacy => {
                let line = rest.split('\n').next().unwrap_or(rest);
                let line = line.strip_suffix('\r').unwrap_or(line);
                (line.len() >= 3 && line.ends_with("}}")).then_some(line.len())
            }
        }
    }
}

/// Counts kept while scanning one file. Only used for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractionStats {
    pub markers: usize,
    pub extracted: usize,
    pub mismatched: usize,
}

#[derive(Debug, Clone)]
pub struct LogExtractor {
    marker: String,
    strategy: ExtractionStrategy,
}

impl LogExtractor {
    pub fn new(marker: impl Into<String>, strategy: ExtractionStrategy) -> Self {
        Self {
            marker: marker.into(),
            strategy,
        }
    }

    pub fn strategy(&self) -> ExtractionStrategy {
        self.strategy
    }

    /// Lazily yields every payload in `text`, in appearance order.
    pub fn payloads<'a>(&'a self, text: &'a str) -> Payloads<'a> {
        Payloads {
            text,
            marker: &self.marker,
            strategy: self.strategy,
            cursor: 0,
            stats: ExtractionStats::default(),
        }
    }
}

/// Iterator over the payloads of one file. See [`LogExtractor::payloads`].
pub struct Payloads<'a> {
    text: &'a str,
    marker: &'a str,
    strategy: ExtractionStrategy,
    cursor: usize,
    stats: ExtractionStats,
}

impl<'a> Payloads<'a> {
    pub fn stats(&self) -> ExtractionStats {
        self.stats
    }
}

impl<'a> Iterator for Payloads<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        if self.marker.is_empty() {
            return None;
        }

        loop {
            let offset = self.text[self.cursor..].find(self.marker)?;
            let start = self.cursor + offset + self.marker.len();
            self.stats.markers += 1;

            match self.strategy.capture(&self.text[start..]) {
                Some(len) => {
                    self.cursor = start + len;
                    self.stats.extracted += 1;
                    return Some(&self.text[start..start + len]);
                }
                None => {
                    // Keep scanning after the marker; a later marker may still match.
                    self.stats.mismatched += 1;
                    warn!(
                        offset = start,
                        strategy = ?self.strategy,
                        "Marker without a capturable payload"
                    );
                    self.cursor = start;
                }
            }
        }
    }
}
