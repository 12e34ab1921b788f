//! Hierarchical path and segment model.
//!
//! A [`Path`] is an ordered sequence of [`Segment`]s from the root. The
//! root path has zero segments. Escaping is defined so that the escaped
//! form of a path is byte-stable and safe to use directly as a storage key:
//! `/` inside a segment becomes `-X`, `\` becomes `-Y`, and the literal
//! `-` is itself escaped to `-Z` so the mapping stays a bijection.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single path component. Empty segments are not constructible directly
/// through [`Path::child`] — they are elided, matching the "default/empty
/// segments are elided on construction" rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Segment(String);

impl Segment {
    /// Creates a segment from raw text. Returns `None` for the empty
    /// string, which is elided rather than stored.
    pub fn new(text: impl Into<String>) -> Option<Self> {
        let text = text.into();
        if text.is_empty() {
            None
        } else {
            Some(Self(text))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn escape(&self) -> String {
        let mut out = String::with_capacity(self.0.len());
        for ch in self.0.chars() {
            match ch {
                '/' => out.push_str("-X"),
                '\\' => out.push_str("-Y"),
                '-' => out.push_str("-Z"),
                other => out.push(other),
            }
        }
        out
    }

    fn unescape(escaped: &str) -> Self {
        let mut out = String::with_capacity(escaped.len());
        let mut chars = escaped.chars().peekable();
        while let Some(ch) = chars.next() {
            if ch == '-' {
                match chars.peek() {
                    Some('X') => {
                        out.push('/');
                        chars.next();
                    }
                    Some('Y') => {
                        out.push('\\');
                        chars.next();
                    }
                    Some('Z') => {
                        out.push('-');
                        chars.next();
                    }
                    _ => out.push(ch),
                }
            } else {
                out.push(ch);
            }
        }
        Segment(out)
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An ordered sequence of segments addressing one entry in the tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Path {
    segments: Vec<Segment>,
}

impl Path {
    /// The root path — zero segments.
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    /// Builds a path from an iterator of raw segment text, eliding any
    /// empty components.
    pub fn from_parts<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: parts.into_iter().filter_map(Segment::new).collect(),
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// The last segment, or `None` for the root.
    pub fn name(&self) -> Option<&Segment> {
        self.segments.last()
    }

    /// The parent path, or `None` for the root.
    pub fn parent(&self) -> Option<Path> {
        if self.segments.is_empty() {
            None
        } else {
            Some(Path {
                segments: self.segments[..self.segments.len() - 1].to_vec(),
            })
        }
    }

    /// Every strict ancestor, root first, ending at (but not including)
    /// `self`. Empty for the root.
    pub fn ancestors(&self) -> Vec<Path> {
        let mut out = Vec::with_capacity(self.segments.len());
        for depth in 0..self.segments.len() {
            out.push(Path {
                segments: self.segments[..depth].to_vec(),
            });
        }
        out
    }

    /// Appends one segment.
    pub fn child(&self, segment: impl Into<String>) -> Option<Path> {
        let segment = Segment::new(segment)?;
        let mut segments = self.segments.clone();
        segments.push(segment);
        Some(Path { segments })
    }

    /// Appends a sub-path (another path's segments).
    pub fn join(&self, sub_path: &Path) -> Path {
        let mut segments = self.segments.clone();
        segments.extend(sub_path.segments.iter().cloned());
        Path { segments }
    }

    /// True if `self` is `other` or a descendant of `other`.
    pub fn is_descendant_of(&self, other: &Path) -> bool {
        self.segments.len() >= other.segments.len()
            && self.segments[..other.segments.len()] == other.segments[..]
    }

    /// Byte-stable escaped form, usable directly as a storage key:
    /// `/` + each segment escaped + `/`, joined and trailing-slashed.
    pub fn escaped_form(&self) -> String {
        let mut out = String::from("/");
        for segment in &self.segments {
            out.push_str(&segment.escape());
            out.push('/');
        }
        out
    }

    /// Parses the escaped form produced by [`Path::escaped_form`].
    pub fn from_escaped(escaped: &str) -> Self {
        let trimmed = escaped.trim_start_matches('/').trim_end_matches('/');
        if trimmed.is_empty() {
            return Path::root();
        }
        let segments = trimmed.split('/').map(Segment::unescape).collect();
        Path { segments }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.escaped_form())
    }
}
