//! 测试输出解析
//!
//! 支持 pytest `-rA` 摘要（PASSED/FAILED/ERROR 行 + 下划线分节的失败详情）、
//! cargo test（`test x ... ok|FAILED` 与 `---- x stdout ----` 分节）、go test（`--- PASS|FAIL: X`）
//! 以及 `path:line:col: CODE message` 形式的 lint 行。

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use super::{Diagnostic, TestCase, TestReport};

/// 输出中没有任何可识别失败、但退出码非零时，取末尾多少行作为诊断
const TAIL_LINES: usize = 30;

/// pytest 退出码 5：没有收集到测试
const PYTEST_NO_TESTS: i32 = 5;

struct Patterns {
    section: Regex,
    cargo_section: Regex,
    rule: Regex,
    summary: Regex,
    cargo_case: Regex,
    go_case: Regex,
    lint: Regex,
}

fn patterns() -> Option<&'static Patterns> {
    static PATTERNS: OnceLock<Option<Patterns>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            Some(Patterns {
                section: Regex::new(r"^_{2,} (.+?) _{2,}$").ok()?,
                cargo_section: Regex::new(r"^---- (\S+) stdout ----$").ok()?,
                rule: Regex::new(r"^(={3,}|!{3,})").ok()?,
                summary: Regex::new(r"^(PASSED|FAILED|ERROR|XPASS) (\S+)(?: - (.*))?$").ok()?,
                cargo_case: Regex::new(r"^test (\S+) \.\.\. (ok|FAILED)$").ok()?,
                go_case: Regex::new(r"^\s*--- (PASS|FAIL): (\S+)").ok()?,
                lint: Regex::new(r"^(.+?):(\d+):(\d+): ([A-Z]+\d+):? (.+)$").ok()?,
            })
        })
        .as_ref()
}

/// 解析一次测试运行的合并输出
pub fn parse_report(exit_code: i32, output: &str) -> TestReport {
    let mut report = TestReport {
        exit_code,
        raw_output: output.to_string(),
        ..Default::default()
    };
    let Some(p) = patterns() else {
        report.diagnostics.push(tail_diagnostic(output));
        return report;
    };

    let sections = collect_sections(p, output);

    for line in output.lines() {
        let line = line.trim_end();
        if let Some(c) = p.summary.captures(line) {
            let status = &c[1];
            let nodeid = c[2].to_string();
            let message = c.get(3).map(|m| m.as_str().to_string());
            let passed = matches!(status, "PASSED" | "XPASS");
            report.cases.push(TestCase {
                name: nodeid.clone(),
                passed,
            });
            if !passed {
                let body = section_for(&sections, &nodeid, status == "ERROR");
                report.diagnostics.push(Diagnostic {
                    text: body.or(message).unwrap_or_else(|| format!("{status} {nodeid}")),
                    file_path: nodeid.split("::").next().map(str::to_string),
                    line: None,
                    test_name: Some(nodeid),
                    lint_rule: None,
                });
            }
        } else if let Some(c) = p.cargo_case.captures(line) {
            let name = c[1].to_string();
            let passed = &c[2] == "ok";
            report.cases.push(TestCase {
                name: name.clone(),
                passed,
            });
            if !passed {
                report.diagnostics.push(Diagnostic {
                    text: sections
                        .get(&name)
                        .cloned()
                        .unwrap_or_else(|| format!("test {name} failed")),
                    file_path: None,
                    line: None,
                    test_name: Some(name),
                    lint_rule: None,
                });
            }
        } else if let Some(c) = p.go_case.captures(line) {
            let name = c[2].to_string();
            let passed = &c[1] == "PASS";
            report.cases.push(TestCase {
                name: name.clone(),
                passed,
            });
            if !passed {
                report.diagnostics.push(Diagnostic {
                    text: format!("--- FAIL: {name}"),
                    file_path: None,
                    line: None,
                    test_name: Some(name),
                    lint_rule: None,
                });
            }
        } else if let Some(c) = p.lint.captures(line) {
            report.diagnostics.push(Diagnostic {
                text: format!("{}: {}", &c[4], &c[5]),
                file_path: Some(c[1].to_string()),
                line: c[2].parse().ok(),
                test_name: None,
                lint_rule: Some(c[4].to_string()),
            });
        }
    }

    if report.diagnostics.is_empty() && exit_code != 0 && exit_code != PYTEST_NO_TESTS {
        report.diagnostics.push(tail_diagnostic(output));
    }
    report
}

/// 按分节标题收集正文（pytest 下划线标题、cargo `---- name stdout ----`）
fn collect_sections(p: &Patterns, output: &str) -> HashMap<String, String> {
    let mut sections: HashMap<String, String> = HashMap::new();
    let mut current: Option<(String, Vec<&str>)> = None;
    for line in output.lines() {
        let trimmed = line.trim_end();
        let header = p
            .section
            .captures(trimmed)
            .or_else(|| p.cargo_section.captures(trimmed))
            .map(|c| c[1].to_string());
        if header.is_some() || p.rule.is_match(trimmed) {
            if let Some((title, body)) = current.take() {
                sections.insert(title, body.join("\n").trim().to_string());
            }
            current = header.map(|h| (h, Vec::new()));
            continue;
        }
        if let Some((_, body)) = current.as_mut() {
            body.push(line);
        }
    }
    if let Some((title, body)) = current {
        sections.insert(title, body.join("\n").trim().to_string());
    }
    sections
}

fn section_for(sections: &HashMap<String, String>, nodeid: &str, is_error: bool) -> Option<String> {
    let func = nodeid.rsplit("::").next().unwrap_or(nodeid);
    let candidates = if is_error {
        vec![
            format!("ERROR collecting {nodeid}"),
            format!("ERROR at setup of {func}"),
            nodeid.to_string(),
        ]
    } else {
        let class_qualified = nodeid.splitn(2, "::").nth(1).map(|s| s.replace("::", "."));
        let mut v = vec![func.to_string()];
        v.extend(class_qualified);
        v
    };
    candidates
        .iter()
        .find_map(|k| sections.get(k))
        .filter(|b| !b.is_empty())
        .cloned()
}

fn tail_diagnostic(output: &str) -> Diagnostic {
    let lines: Vec<&str> = output.lines().collect();
    let start = lines.len().saturating_sub(TAIL_LINES);
    Diagnostic {
        text: lines[start..].join("\n"),
        ..Default::default()
    }
}
