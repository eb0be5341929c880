//! Keyword heuristics over prompt text
//!
//! Two cheap classifiers used by the graph:
//! - explore/build mode derivation after a prompt edit
//! - "critical" prompt detection for build-session impact flags

use crate::types::Mode;

/// Word stems that signal the user wants something produced
const BUILD_SIGNALS: &[&str] = &[
    "build", "implement", "create", "write", "draft", "generate", "produce", "ship", "deliver",
    "code", "fix", "refactor", "deploy",
];

/// Word stems that signal open-ended exploration
const EXPLORE_SIGNALS: &[&str] = &[
    "explore", "brainstorm", "compare", "why", "idea", "research", "investigate", "consider",
    "option", "alternative", "what", "how",
];

/// Substrings that mark a prompt as load-bearing for derived plans
const CRITICAL_KEYWORDS: &[&str] = &["constraint", "requirement", "risk", "decision", "must", "critical"];

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
}

fn has_stem(words: &[String], stems: &[&str]) -> bool {
    words.iter().any(|w| stems.iter().any(|s| w.starts_with(s)))
}

/// Derive a working mode from prompt text
///
/// Any word starting with "plan" forces build; otherwise build signals
/// outrank explore signals, and text with neither is exploratory.
#[must_use]
pub fn derive_mode(text: &str) -> Mode {
    let words: Vec<String> = words(text).collect();

    if words.iter().any(|w| w.starts_with("plan")) || has_stem(&words, BUILD_SIGNALS) {
        return Mode::Build;
    }
    if has_stem(&words, EXPLORE_SIGNALS) {
        return Mode::Explore;
    }
    Mode::Explore
}

/// Case-insensitive substring match against the critical keyword list
#[must_use]
pub fn is_critical(text: &str) -> bool {
    let lower = text.to_lowercase();
    CRITICAL_KEYWORDS.iter().any(|k| lower.contains(k))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_alone_forces_build() {
        assert_eq!(derive_mode("Let's plan the migration"), Mode::Build);
        assert_eq!(derive_mode("Planning notes"), Mode::Build);
    }

    #[test]
    fn build_outranks_explore() {
        assert_eq!(derive_mode("Explore options and then implement the parser"), Mode::Build);
    }

    #[test]
    fn explore_words_and_plain_text_are_explore() {
        assert_eq!(derive_mode("Brainstorm naming ideas"), Mode::Explore);
        assert_eq!(derive_mode("The sky is blue"), Mode::Explore);
    }

    #[test]
    fn critical_is_substring_and_case_insensitive() {
        assert!(is_critical("Latency REQUIREMENTS for the API"));
        assert!(is_critical("we mustn't forget"));
        assert!(is_critical("Key decision: postgres"));
        assert!(!is_critical("A nice idea"));
    }
}
