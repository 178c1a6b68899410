//! Maps names supplied by the portal (file names, folder names, titles) to
//! path components that are safe on every platform we write to.
//!
//! The mapping is a pure function of its input, so a remote name always lands
//! on the same local path across runs.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::Regex;

/// Longest component we emit, counted in characters
const MAX_COMPONENT_LENGTH: usize = 100;

/// Anything that is not a letter, digit, underscore, space, dot, parenthesis or hyphen
static ILLEGAL_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w .()\-]").unwrap());
static UNDERSCORE_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"_+").unwrap());

const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

pub fn sanitize_filename(name: &str) -> String {
    if name.is_empty() {
        return "_unknown_".to_string();
    }

    let name = repair_mojibake(name);
    let replaced = ILLEGAL_CHARS.replace_all(&name, "_");
    let collapsed = UNDERSCORE_RUNS.replace_all(&replaced, "_");
    let trimmed = collapsed.trim_matches(|c| c == ' ' || c == '_');

    if trimmed.is_empty() {
        return "_sanitized_empty_".to_string();
    }

    let mut sanitized = truncate_component(trimmed);

    // Windows refuses names ending in a dot
    if sanitized.ends_with('.') {
        sanitized.pop();
        sanitized.push('_');
    }

    if RESERVED_NAMES.contains(&sanitized.to_uppercase().as_str()) {
        sanitized.push('_');
    }

    sanitized
}

/// Undo a UTF-8 name that was decoded as Latin-1 somewhere upstream.
///
/// Only applies when every character fits in one Latin-1 byte and those bytes
/// form valid UTF-8; anything else is returned untouched.
pub fn repair_mojibake(name: &str) -> Cow<'_, str> {
    if name.is_ascii() {
        return Cow::Borrowed(name);
    }

    let bytes: Option<Vec<u8>> = name
        .chars()
        .map(|c| u8::try_from(u32::from(c)).ok())
        .collect();

    match bytes.and_then(|bytes| String::from_utf8(bytes).ok()) {
        Some(repaired) => Cow::Owned(repaired),
        None => Cow::Borrowed(name),
    }
}

/// Split `name` into stem and extension the way most platforms do: the
/// extension starts at the last dot, unless that dot only belongs to a run of
/// leading dots (".bashrc" has no extension).
pub fn split_extension(name: &str) -> (&str, &str) {
    let leading_dots = name.len() - name.trim_start_matches('.').len();
    match name.rfind('.') {
        Some(index) if index >= leading_dots => name.split_at(index),
        _ => (name, ""),
    }
}

fn truncate_component(name: &str) -> String {
    let length = name.chars().count();
    if length <= MAX_COMPONENT_LENGTH {
        return name.to_string();
    }

    let (stem, extension) = split_extension(name);
    let extension_length = extension.chars().count();

    if extension.is_empty() || extension_length >= MAX_COMPONENT_LENGTH {
        return name.chars().take(MAX_COMPONENT_LENGTH).collect();
    }

    let mut truncated: String = stem
        .chars()
        .take(MAX_COMPONENT_LENGTH - extension_length)
        .collect();
    truncated.push_str(extension);
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_illegal_characters_become_underscores() {
        assert_eq!(sanitize_filename("a:b?c.pdf"), "a_b_c.pdf");
        assert_eq!(sanitize_filename("hw/1\\final*.zip"), "hw_1_final_.zip");
        assert_eq!(sanitize_filename("  __Lecture 1__  "), "Lecture 1");
    }

    #[test]
    fn test_sanitization_is_deterministic() {
        let raw = "Week 3: \"Sorting\" <draft>?.pptx";
        let first = sanitize_filename(raw);
        for _ in 0..5 {
            assert_eq!(sanitize_filename(raw), first);
        }
        assert_eq!(first, "Week 3_ _Sorting_ _draft_.pptx");
    }

    #[test]
    fn test_turkish_letters_survive() {
        assert_eq!(sanitize_filename("Sınıf Dosyaları"), "Sınıf Dosyaları");
        assert_eq!(sanitize_filename("Ödevler"), "Ödevler");
    }

    #[test]
    fn test_reserved_device_names() {
        assert_eq!(sanitize_filename("CON"), "CON_");
        assert_eq!(sanitize_filename("lpt1"), "lpt1_");
        assert_eq!(sanitize_filename("CON.txt"), "CON.txt");
    }

    #[test]
    fn test_empty_and_degenerate_names() {
        assert_eq!(sanitize_filename(""), "_unknown_");
        assert_eq!(sanitize_filename("???"), "_sanitized_empty_");
        assert_eq!(sanitize_filename("report."), "report_");
    }

    #[test]
    fn test_long_names_keep_their_extension() {
        let long = format!("{}.pdf", "x".repeat(150));
        let sanitized = sanitize_filename(&long);
        assert_eq!(sanitized.chars().count(), MAX_COMPONENT_LENGTH);
        assert!(sanitized.ends_with(".pdf"));

        let no_extension = "y".repeat(150);
        assert_eq!(sanitize_filename(&no_extension), "y".repeat(100));
    }

    #[test]
    fn test_mojibake_is_repaired() {
        // "Ödev" encoded as UTF-8 and decoded as Latin-1
        assert_eq!(sanitize_filename("\u{c3}\u{96}dev.pdf"), "Ödev.pdf");
        // proper Latin-1 text is not valid UTF-8 and stays as is
        assert_eq!(repair_mojibake("caf\u{e9}"), "caf\u{e9}");
    }

    #[test]
    fn test_split_extension() {
        assert_eq!(split_extension("report.pdf"), ("report", ".pdf"));
        assert_eq!(split_extension("archive.tar.gz"), ("archive.tar", ".gz"));
        assert_eq!(split_extension(".bashrc"), (".bashrc", ""));
        assert_eq!(split_extension("README"), ("README", ""));
    }
}
