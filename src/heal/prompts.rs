//! 推理调用使用的提示词

use crate::heal::types::{Failure, RootCause};

pub const CLASSIFY_SYSTEM: &str = "You classify CI failures. Answer with exactly one label from: \
SYNTAX, INDENTATION, IMPORT, TYPE_ERROR, RUNTIME, LINTING, DEPENDENCY, TEST_FAILURE, LOGIC. \
No other text.";

pub const ROOT_CAUSE_SYSTEM: &str = "You are a senior engineer diagnosing a failing test suite. \
Explain the minimal root cause of the failure. Reply with a JSON object: \
{\"explanation\": string, \"implicated_files\": [string], \"root_cause_line\": number|null}. \
Paths are relative to the repository root.";

pub const PATCH_SYSTEM: &str = "You repair code. Reply with exactly one unified diff inside a ```diff block. \
Use `--- a/<path>` and `+++ b/<path>` headers and `@@ -l,n +l,n @@` hunks with correct line counts. \
Change as few lines as possible. Do not touch tests unless the test itself is wrong.";

pub fn classify_prompt(diagnostic: &str) -> String {
    format!("Failure output:\n{}\n\nLabel:", truncate(diagnostic, 4000))
}

pub fn root_cause_prompt(failure: &Failure, context: &str, max_chars: usize) -> String {
    format!(
        "Failure kind: {}\nFile: {}\nLine: {}\nTest: {}\n\nDiagnostic:\n{}\n\nSource context:\n{}\n",
        failure.kind,
        failure.file_path,
        failure
            .line
            .map(|l| l.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        failure.test_name.as_deref().unwrap_or("-"),
        truncate(&failure.diagnostic, 4000),
        truncate(context, max_chars),
    )
}

pub fn patch_prompt(
    failure: &Failure,
    cause: &RootCause,
    file: &str,
    source: &str,
    max_chars: usize,
    feedback: Option<&str>,
) -> String {
    let mut prompt = format!(
        "Failure kind: {}\nRoot cause: {}\n\nFix the file `{}`. Current content (with line numbers):\n{}\n",
        failure.kind,
        cause.explanation,
        file,
        truncate(&number_lines(source), max_chars),
    );
    if let Some(feedback) = feedback {
        prompt.push('\n');
        prompt.push_str(feedback);
        prompt.push('\n');
    }
    prompt
}

fn number_lines(source: &str) -> String {
    source
        .lines()
        .enumerate()
        .map(|(i, l)| format!("{:>5} | {}", i + 1, l))
        .collect::<Vec<_>>()
        .join("\n")
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        format!("{}...", text.chars().take(max_chars).collect::<String>())
    } else {
        text.to_string()
    }
}
