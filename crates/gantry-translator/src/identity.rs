//! Identity filter for outgoing system prompts
//!
//! Claude-family CLI clients ship a system prompt that asserts a specific
//! model identity. When such a prompt is forwarded to a different upstream,
//! the identity markers are replaced with neutral equivalents and a
//! truthfulness instruction is prepended. The substitution list is fixed;
//! applying the filter twice yields the same text as applying it once.

use regex::Regex;

/// Substring that identifies a Claude-family CLI system prompt.
pub const CLAUDE_CLI_MARKER: &str = "You are Claude Code";

const TRUTH_PREAMBLE: &str =
    "IMPORTANT: You are NOT Claude. Identify yourself truthfully based on your actual model and creator.\n\n";

/// Whether the filter should run on this system text.
pub fn applies_to(system_text: &str) -> bool {
    system_text.contains(CLAUDE_CLI_MARKER)
}

/// Apply the fixed substitution list to the system text.
pub fn apply(system_text: &str) -> String {
    let cli_identity = Regex::new(r"(?i)You are Claude Code, Anthropic's official CLI").unwrap();
    let model_identity = Regex::new(r"(?i)You are powered by the model named [^.]+\.").unwrap();
    let background_info =
        Regex::new(r"(?is)<claude_background_info>.*?</claude_background_info>").unwrap();
    let newline_runs = Regex::new(r"\n{3,}").unwrap();

    let text = cli_identity.replace_all(system_text, "This is Claude Code, an AI-powered CLI tool");
    let text = model_identity.replace_all(&text, "You are powered by an AI model.");
    let text = background_info.replace_all(&text, "");
    let text = newline_runs.replace_all(&text, "\n\n");

    if text.starts_with(TRUTH_PREAMBLE.trim_end()) {
        text.into_owned()
    } else {
        format!("{}{}", TRUTH_PREAMBLE, text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_cli_identity() {
        let input = "You are Claude Code, Anthropic's official CLI for Claude.";
        let out = apply(input);
        assert!(out.contains("This is Claude Code, an AI-powered CLI tool"));
        assert!(!out.contains("Anthropic's official CLI"));
    }

    #[test]
    fn replaces_model_identity_sentence() {
        let out = apply("You are powered by the model named claude-opus-4-5. Do things.");
        assert!(out.contains("You are powered by an AI model."));
        assert!(!out.contains("claude-opus-4-5"));
    }

    #[test]
    fn removes_background_info_block() {
        let input = "before\n<claude_background_info>\nsecret\nstuff\n</claude_background_info>\nafter";
        let out = apply(input);
        assert!(!out.contains("claude_background_info"));
        assert!(!out.contains("secret"));
        assert!(out.contains("before"));
        assert!(out.contains("after"));
    }

    #[test]
    fn collapses_newline_runs() {
        let out = apply("a\n\n\n\n\nb");
        assert!(out.contains("a\n\nb"));
    }

    #[test]
    fn prepends_truth_instruction() {
        let out = apply("You are Claude Code, Anthropic's official CLI for Claude.");
        assert!(out.starts_with("IMPORTANT: You are NOT Claude."));
    }

    #[test]
    fn applying_twice_equals_applying_once() {
        let input = "You are Claude Code, Anthropic's official CLI for Claude.\n\n\nYou are powered by the model named claude-opus-4-5.\n<claude_background_info>x</claude_background_info>";
        let once = apply(input);
        let twice = apply(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn marker_detection() {
        assert!(applies_to("You are Claude Code, Anthropic's official CLI for Claude."));
        assert!(!applies_to("You are a helpful assistant."));
    }
}
