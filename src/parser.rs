//! Content-parser plug-in capability (§9).
//!
//! "Parser plug-ins are a capability set, not a class hierarchy" — this
//! module defines that capability set and ships one trivial implementation
//! so the Dispatcher's content-extraction path is exercised end-to-end.
//! Real document parsers (office formats, PDFs, …) are someone else's
//! plug-in; their internals are explicitly out of scope.

use std::path::Path;
use std::time::Duration;

pub const DEFAULT_PARSER_TIMEOUT: Duration = Duration::from_secs(5);

/// Metadata a parser may attach alongside extracted text.
#[derive(Debug, Clone, Default)]
pub struct ParsedMetadata {
    pub title: Option<String>,
}

/// `{supports_extension?, parse(path, max_bytes) -> (text, metadata)}`.
pub trait ContentParser: Send + Sync {
    fn supports_extension(&self, extension: &str) -> bool;

    fn parse(&self, path: &Path, max_bytes: usize) -> std::io::Result<(String, ParsedMetadata)>;
}

/// Registry of configured parsers, checked in registration order.
#[derive(Default)]
pub struct ParserRegistry {
    parsers: Vec<Box<dyn ContentParser>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, parser: Box<dyn ContentParser>) {
        self.parsers.push(parser);
    }

    pub fn find_for_extension(&self, extension: &str) -> Option<&dyn ContentParser> {
        self.parsers
            .iter()
            .find(|p| p.supports_extension(extension))
            .map(|p| p.as_ref())
    }
}

/// Default, trivial parser for plain-text formats.
///
/// Truncates at `max_bytes` without attempting to respect UTF-8 character
/// boundaries beyond what `String::from_utf8_lossy` already guarantees;
/// the Dispatcher applies the documented `" ... [truncated]"` marker and
/// character-count limit on top of this.
pub struct PlainTextParser;

impl ContentParser for PlainTextParser {
    fn supports_extension(&self, extension: &str) -> bool {
        matches!(extension, "txt" | "md" | "markdown")
    }

    fn parse(&self, path: &Path, max_bytes: usize) -> std::io::Result<(String, ParsedMetadata)> {
        let bytes = std::fs::read(path)?;
        let truncated = &bytes[..bytes.len().min(max_bytes)];
        let text = String::from_utf8_lossy(truncated).into_owned();
        Ok((text, ParsedMetadata::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_parser_supports_known_extensions() {
        let parser = PlainTextParser;
        assert!(parser.supports_extension("txt"));
        assert!(parser.supports_extension("md"));
        assert!(!parser.supports_extension("pdf"));
    }

    #[test]
    fn plain_text_parser_reads_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        std::fs::write(&path, "hello world").unwrap();

        let parser = PlainTextParser;
        let (text, _) = parser.parse(&path, 5).unwrap();
        assert_eq!(text, "hello");
    }

    #[test]
    fn registry_finds_matching_parser() {
        let mut registry = ParserRegistry::new();
        registry.register(Box::new(PlainTextParser));
        assert!(registry.find_for_extension("md").is_some());
        assert!(registry.find_for_extension("exe").is_none());
    }
}
