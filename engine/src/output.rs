//! Minimal result rendering for the CLI: an aligned text table and plain
//! JSON. Richer formats (markdown, SARIF) come from external formatters.

use visor_types::{GroupedResults, Severity, StepConclusion};

pub fn render_json(results: &GroupedResults) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(results)?)
}

pub fn render_table(results: &GroupedResults) -> String {
    let mut rows: Vec<[String; 5]> = Vec::new();
    for (root, group) in &results.groups {
        for result in group {
            let conclusion = match &result.conclusion {
                StepConclusion::Success => "success".to_string(),
                StepConclusion::Failed => "failed".to_string(),
                StepConclusion::Skipped { reason } => {
                    format!("skipped ({})", serde_json::to_value(reason)
                        .ok()
                        .and_then(|v| v.as_str().map(str::to_string))
                        .unwrap_or_default())
                }
            };
            rows.push([
                root.clone(),
                result.step.clone(),
                if result.scope.is_empty() {
                    "-".to_string()
                } else {
                    result.scope.clone()
                },
                conclusion,
                format!("{}ms", result.duration_ms),
            ]);
        }
    }

    let headers = ["GROUP", "STEP", "SCOPE", "RESULT", "TIME"];
    let mut widths = headers.map(str::len);
    for row in &rows {
        for (index, cell) in row.iter().enumerate() {
            widths[index] = widths[index].max(cell.len());
        }
    }

    let mut out = String::new();
    let mut push_row = |cells: [&str; 5], out: &mut String| {
        for (index, cell) in cells.iter().enumerate() {
            out.push_str(&format!("{:<width$}  ", cell, width = widths[index]));
        }
        out.push('\n');
    };
    push_row(headers, &mut out);
    for row in &rows {
        push_row(
            [&row[0], &row[1], &row[2], &row[3], &row[4]],
            &mut out,
        );
    }

    let issues = results.issues();
    if !issues.is_empty() {
        out.push('\n');
        out.push_str(&format!("{} issue(s):\n", issues.len()));
        for issue in issues {
            let severity = match issue.severity {
                Severity::Info => "info",
                Severity::Warning => "warning",
                Severity::Error => "error",
                Severity::Critical => "critical",
            };
            let location = issue
                .step
                .as_deref()
                .map(str::to_string)
                .unwrap_or_else(|| "run".to_string());
            out.push_str(&format!(
                "  [{severity}] {location}: {} ({})\n",
                issue.message, issue.rule_id
            ));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::BTreeMap;
    use visor_types::{Issue, RunConclusion, StepResult};

    fn sample() -> GroupedResults {
        let mut groups = BTreeMap::new();
        groups.insert(
            "review".to_string(),
            vec![StepResult {
                step: "review".to_string(),
                scope: String::new(),
                conclusion: StepConclusion::Success,
                issues: vec![Issue::new("style/naming", Severity::Warning, "odd name")],
                output: json!({"ok": true}),
                content: None,
                error: None,
                duration_ms: 12,
                started_at: Utc::now(),
                finished_at: Utc::now(),
            }],
        );
        GroupedResults {
            run_id: "run-1".to_string(),
            conclusion: RunConclusion::Completed,
            groups,
            run_issues: Vec::new(),
            duration_ms: 15,
        }
    }

    #[test]
    fn table_lists_steps_and_issues() {
        let rendered = render_table(&sample());
        assert!(rendered.contains("STEP"));
        assert!(rendered.contains("review"));
        assert!(rendered.contains("success"));
        assert!(rendered.contains("odd name"));
    }

    #[test]
    fn json_round_trips() {
        let rendered = render_json(&sample()).unwrap();
        let parsed: GroupedResults = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed.run_id, "run-1");
    }
}
