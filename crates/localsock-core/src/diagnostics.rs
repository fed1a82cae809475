//! Diagnostic string rendering
//!
//! Turns an ordered list of (label, value) pairs into a single log line or
//! into markdown entries suitable for bug and crash reports. Owners rebuild
//! the list from their current state each time a string is requested.

use std::fmt::Display;

/// Value rendered for entries that have no value.
pub const NO_VALUE: &str = "-";

/// Ordered (label, value) pairs with log-line and markdown renderings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiagnosticStringGenerator {
    entries: Vec<(String, String)>,
}

impl DiagnosticStringGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry
    pub fn push(&mut self, label: impl Into<String>, value: impl Display) -> &mut Self {
        self.entries.push((label.into(), value.to_string()));
        self
    }

    /// Append an entry, rendering `None` as [`NO_VALUE`]
    pub fn push_optional<T: Display>(
        &mut self,
        label: impl Into<String>,
        value: Option<T>,
    ) -> &mut Self {
        match value {
            Some(value) => self.push(label, value),
            None => self.push(label, NO_VALUE),
        }
    }

    /// Replace all entries
    pub fn set_entries<I, L, V>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (L, V)>,
        L: Into<String>,
        V: Display,
    {
        self.entries = entries
            .into_iter()
            .map(|(label, value)| (label.into(), value.to_string()))
            .collect();
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `Label1: value1 Label2: value2 ...`
    pub fn log_string(&self) -> String {
        self.entries
            .iter()
            .map(|(label, value)| format!("{}: {}", label, value))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// One `**Label**: `value`  ` line per entry
    pub fn markdown_string(&self) -> String {
        self.entries
            .iter()
            .map(|(label, value)| markdown_entry(label, value))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Render one single-line markdown entry.
pub fn markdown_entry(label: &str, value: &str) -> String {
    format!("**{}**: {}  ", label, markdown_code(value))
}

/// Inline code span; values that contain a backtick get a double-backtick fence.
fn markdown_code(value: &str) -> String {
    if value.contains('`') {
        format!("`` {} ``", value)
    } else {
        format!("`{}`", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DiagnosticStringGenerator {
        let mut generator = DiagnosticStringGenerator::new();
        generator.push("Path", "/tmp/a.sock").push("FD", -1).push("Backlog", 50);
        generator
    }

    #[test]
    fn test_log_string() {
        assert_eq!(sample().log_string(), "Path: /tmp/a.sock FD: -1 Backlog: 50");
    }

    #[test]
    fn test_markdown_string() {
        assert_eq!(
            sample().markdown_string(),
            "**Path**: `/tmp/a.sock`  \n**FD**: `-1`  \n**Backlog**: `50`  "
        );
    }

    #[test]
    fn test_log_and_markdown_enumerate_same_pairs() {
        let generator = sample();
        let log = generator.log_string();
        let markdown = generator.markdown_string();

        for (label, value) in generator.entries() {
            assert!(log.contains(&format!("{}: {}", label, value)));
            assert!(markdown.contains(&markdown_entry(label, value)));
        }
        assert_eq!(markdown.lines().count(), generator.entries().len());
    }

    #[test]
    fn test_optional_and_backtick_values() {
        let mut generator = DiagnosticStringGenerator::new();
        generator.push_optional::<u32>("Pid", None).push("Cmd", "echo `id`");

        assert_eq!(generator.log_string(), "Pid: - Cmd: echo `id`");
        assert_eq!(
            generator.markdown_string(),
            "**Pid**: `-`  \n**Cmd**: `` echo `id` ``  "
        );
    }

    #[test]
    fn test_set_entries_replaces() {
        let mut generator = sample();
        generator.set_entries([("State", "Running")]);
        assert_eq!(generator.log_string(), "State: Running");
    }

    #[test]
    fn test_empty_generator() {
        let generator = DiagnosticStringGenerator::new();
        assert!(generator.is_empty());
        assert_eq!(generator.log_string(), "");
        assert_eq!(generator.markdown_string(), "");
    }
}
