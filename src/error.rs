#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Registry,
    Workflow,
    Pipeline,
    Storage,
    Input,
    Internal,
}

impl ErrorCategory {
    pub fn code(self) -> &'static str {
        match self {
            ErrorCategory::Registry => "REGISTRY",
            ErrorCategory::Workflow => "WORKFLOW",
            ErrorCategory::Pipeline => "PIPELINE",
            ErrorCategory::Storage => "STORAGE",
            ErrorCategory::Input => "INPUT",
            ErrorCategory::Internal => "INTERNAL",
        }
    }

    pub fn hint(self) -> &'static str {
        match self {
            ErrorCategory::Registry => {
                "Run galaxy-bridge agents list and check .galaxy/agents.toml for the missing capability."
            }
            ErrorCategory::Workflow => {
                "Run galaxy-bridge workflow templates and check .galaxy/workflows.toml step definitions."
            }
            ErrorCategory::Pipeline => {
                "Retry with RUST_LOG=info to see which agent failed while analyzing or fixing the error."
            }
            ErrorCategory::Storage => {
                "Check --state-dir permissions and run galaxy-bridge doctor."
            }
            ErrorCategory::Input => "Run galaxy-bridge --help and correct command arguments.",
            ErrorCategory::Internal => {
                "Retry with RUST_LOG=debug. If it persists, capture logs and open an issue."
            }
        }
    }
}

pub fn categorize_error(err: &anyhow::Error) -> ErrorCategory {
    let msg = format!("{err:#}").to_ascii_lowercase();

    if msg.contains("invalid value")
        || msg.contains("unknown argument")
        || msg.contains("expected key=value")
        || msg.contains("profile")
        || msg.contains("failed to read input")
    {
        return ErrorCategory::Input;
    }

    if msg.contains("no agent available")
        || msg.contains("not loaded")
        || msg.contains("agent catalog")
        || msg.contains("unknown agent")
    {
        return ErrorCategory::Registry;
    }

    if msg.contains("workflow") || msg.contains("step ") {
        return ErrorCategory::Workflow;
    }

    if msg.contains("fix") || msg.contains("backup") || msg.contains("error report") {
        return ErrorCategory::Pipeline;
    }

    if msg.contains("state directory")
        || msg.contains("failed to write")
        || msg.contains("failed to read")
        || msg.contains("checkpoint")
    {
        return ErrorCategory::Storage;
    }

    ErrorCategory::Internal
}

pub fn format_cli_error(err: &anyhow::Error, show_sensitive_config: bool) -> String {
    let category = categorize_error(err);
    let rendered_error = render_error_message(err, show_sensitive_config);
    format!(
        "[{}] {}\nHint: {}",
        category.code(),
        rendered_error,
        category.hint()
    )
}

pub fn render_error_message(err: &anyhow::Error, show_sensitive_config: bool) -> String {
    if show_sensitive_config {
        format!("{err:#}")
    } else {
        redact_sensitive_text(&format!("{err:#}"))
    }
}

pub fn redact_sensitive_text(text: &str) -> String {
    redact_bearer_tokens(&redact_home_paths(text))
}

/// Replace the current user's home directory prefix with `~`.
pub fn redact_home_paths(text: &str) -> String {
    match std::env::var("HOME") {
        Ok(home) if home.len() > 1 => text.replace(&home, "~"),
        _ => text.to_string(),
    }
}

pub fn redact_bearer_tokens(text: &str) -> String {
    const PREFIX: &str = "Bearer ";
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0usize;

    while let Some(offset) = text[cursor..].find(PREFIX) {
        let start = cursor + offset + PREFIX.len();
        out.push_str(&text[cursor..start]);

        let remainder = &text[start..];
        let end = remainder
            .find(|ch: char| ch.is_whitespace() || matches!(ch, '"' | '\'' | ',' | ';'))
            .unwrap_or(remainder.len());
        if end > 0 {
            out.push_str("[REDACTED]");
        }
        cursor = start + end;
    }

    out.push_str(&text[cursor..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categorizes_registry_failures() {
        let err = anyhow::anyhow!("No agent available for publish");
        assert_eq!(categorize_error(&err), ErrorCategory::Registry);
    }

    #[test]
    fn categorizes_unknown_workflow_kind() {
        let err = anyhow::anyhow!("Unknown workflow type: nightly");
        assert_eq!(categorize_error(&err), ErrorCategory::Workflow);
    }

    #[test]
    fn bearer_tokens_are_redacted() {
        let text = "rejected header 'Authorization: Bearer abc123', retry";
        assert_eq!(
            redact_bearer_tokens(text),
            "rejected header 'Authorization: Bearer [REDACTED]', retry"
        );
    }

    #[test]
    fn formatted_error_carries_code_and_hint() {
        let err = anyhow::anyhow!("invalid value for auto_fix_threshold: 3");
        let rendered = format_cli_error(&err, true);
        assert!(rendered.starts_with("[INPUT]"));
        assert!(rendered.contains("Hint:"));
    }
}
