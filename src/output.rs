use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use serde_json::json;

use crate::error::PimError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Json,
    Pretty,
    Minimal,
}

/// Every action returns a human line plus structured details; errors carry a
/// `details.error` discriminator.
#[derive(Debug, Clone, Serialize)]
pub struct ActionResult {
    pub text: String,
    pub details: serde_json::Value,
}

impl ActionResult {
    pub fn new(text: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            text: text.into(),
            details,
        }
    }

    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            details: json!({}),
        }
    }

    pub fn from_error(err: &PimError) -> Self {
        Self {
            text: err.to_string(),
            details: json!({ "error": err.code() }),
        }
    }
}

pub fn print_result(result: &ActionResult, format: Format) {
    match format {
        Format::Json => {
            println!(
                "{}",
                serde_json::to_string(result).unwrap_or_else(|_| "{}".into())
            );
        }
        Format::Pretty => {
            println!("{}", result.text);
            if !result.details.is_null()
                && result.details.as_object().is_none_or(|o| !o.is_empty())
                && let Ok(pretty) = serde_json::to_string_pretty(&result.details)
            {
                println!("{}", pretty.dimmed());
            }
        }
        Format::Minimal => println!("{}", result.text),
    }
}

pub fn print_error(err: &PimError, format: Format) {
    let result = ActionResult::from_error(err);
    match format {
        Format::Json => {
            println!(
                "{}",
                serde_json::to_string(&result).unwrap_or_else(|_| "{}".into())
            );
        }
        Format::Pretty => eprintln!("{} {}", "error:".red().bold(), result.text),
        Format::Minimal => eprintln!("{}\t{}", err.code(), result.text),
    }
}

/// Strip ANSI escape sequences before displaying peer-supplied text.
pub fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' {
            if chars.peek() == Some(&'[') {
                chars.next();
                // CSI: parameters then a final byte in @..~
                for f in chars.by_ref() {
                    if ('\u{40}'..='\u{7e}').contains(&f) {
                        break;
                    }
                }
            }
            continue;
        }
        out.push(c);
    }
    out
}

/// Truncate to `max_len` chars, appending an ellipsis when shortened.
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() > max_len {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_csi_sequences() {
        assert_eq!(strip_ansi("\u{1b}[31mred\u{1b}[0m text"), "red text");
        assert_eq!(strip_ansi("plain"), "plain");
        assert_eq!(strip_ansi("\u{1b}[1;32mbold green\u{1b}[m"), "bold green");
    }

    #[test]
    fn truncates_with_ellipsis() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello world", 8), "hello...");
    }

    #[test]
    fn error_result_carries_code() {
        let res = ActionResult::from_error(&PimError::NotRegistered);
        assert_eq!(res.details["error"], "not_registered");
    }
}
