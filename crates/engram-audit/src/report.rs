//! Audit report rendering: a pure function of the window aggregates in
//! json, csv, or html.

use chrono::{DateTime, Utc};
use engram_schema::{EngramError, Result};

use crate::query::{AuditQuery, WindowAggregates};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Json,
    Csv,
    Html,
}

impl ReportFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Some(ReportFormat::Json),
            "csv" => Some(ReportFormat::Csv),
            "html" => Some(ReportFormat::Html),
            _ => None,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ReportFormat::Json => "application/json",
            ReportFormat::Csv => "text/csv",
            ReportFormat::Html => "text/html; charset=utf-8",
        }
    }
}

pub async fn generate_report(
    query: &AuditQuery,
    window_hours: u32,
    format: ReportFormat,
    include_category_analysis: bool,
) -> Result<Vec<u8>> {
    let since = Utc::now() - chrono::TimeDelta::hours(window_hours as i64);
    let aggregates = query.window_aggregates(since).await?;
    render(&aggregates, since, window_hours, format, include_category_analysis)
}

fn render(
    aggregates: &WindowAggregates,
    since: DateTime<Utc>,
    window_hours: u32,
    format: ReportFormat,
    include_category_analysis: bool,
) -> Result<Vec<u8>> {
    match format {
        ReportFormat::Json => render_json(aggregates, since, window_hours, include_category_analysis),
        ReportFormat::Csv => Ok(render_csv(aggregates, include_category_analysis).into_bytes()),
        ReportFormat::Html => {
            Ok(render_html(aggregates, window_hours, include_category_analysis).into_bytes())
        }
    }
}

fn system_health(aggregates: &WindowAggregates) -> &'static str {
    if aggregates.total_events == 0 {
        return "normal";
    }
    let ratio = aggregates.high_risk_events as f64 / aggregates.total_events as f64;
    if ratio >= 0.1 {
        "high_risk"
    } else if ratio >= 0.05 {
        "elevated"
    } else {
        "normal"
    }
}

fn render_json(
    aggregates: &WindowAggregates,
    since: DateTime<Utc>,
    window_hours: u32,
    include_category_analysis: bool,
) -> Result<Vec<u8>> {
    let mut report = serde_json::json!({
        "report_window_hours": window_hours,
        "window_start": since.to_rfc3339(),
        "generated_at": Utc::now().to_rfc3339(),
        "summary": {
            "total_events": aggregates.total_events,
            "high_risk_events": aggregates.high_risk_events,
            "medium_risk_events": aggregates.medium_risk_events,
            "low_risk_events": aggregates.low_risk_events,
            "failed_events": aggregates.failed_events,
            "compliance_violations": aggregates.compliance_violations,
            "system_health": system_health(aggregates),
        },
        "events_by_type": to_object(&aggregates.by_type),
        "events_by_user": to_object(&aggregates.by_user),
        "events_by_hour": to_object(&aggregates.by_hour),
    });
    if include_category_analysis {
        report["category_analysis"] = serde_json::json!({
            "categorized_events": aggregates.categorized_events,
            "events_by_category": to_object(&aggregates.by_category),
        });
    }
    serde_json::to_vec_pretty(&report).map_err(|e| EngramError::internal(format!("report: {e}")))
}

fn to_object(pairs: &[(String, u64)]) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (key, count) in pairs {
        map.insert(key.clone(), serde_json::json!(count));
    }
    serde_json::Value::Object(map)
}

fn render_csv(aggregates: &WindowAggregates, include_category_analysis: bool) -> String {
    let mut out = String::new();
    out.push_str("section,key,value\n");
    out.push_str(&format!("summary,total_events,{}\n", aggregates.total_events));
    out.push_str(&format!(
        "summary,high_risk_events,{}\n",
        aggregates.high_risk_events
    ));
    out.push_str(&format!(
        "summary,medium_risk_events,{}\n",
        aggregates.medium_risk_events
    ));
    out.push_str(&format!(
        "summary,low_risk_events,{}\n",
        aggregates.low_risk_events
    ));
    out.push_str(&format!("summary,failed_events,{}\n", aggregates.failed_events));
    out.push_str(&format!(
        "summary,compliance_violations,{}\n",
        aggregates.compliance_violations
    ));
    out.push_str(&format!("summary,system_health,{}\n", system_health(aggregates)));
    for (event_type, count) in &aggregates.by_type {
        out.push_str(&format!("events_by_type,{event_type},{count}\n"));
    }
    for (user, count) in &aggregates.by_user {
        out.push_str(&format!("events_by_user,{user},{count}\n"));
    }
    for (hour, count) in &aggregates.by_hour {
        out.push_str(&format!("events_by_hour,{hour},{count}\n"));
    }
    if include_category_analysis {
        for (category, count) in &aggregates.by_category {
            out.push_str(&format!("events_by_category,{category},{count}\n"));
        }
    }
    out
}

fn render_html(
    aggregates: &WindowAggregates,
    window_hours: u32,
    include_category_analysis: bool,
) -> String {
    let mut sections = String::new();
    sections.push_str(&table("Events by type", &aggregates.by_type));
    sections.push_str(&table("Events by user", &aggregates.by_user));
    sections.push_str(&table("Events by hour", &aggregates.by_hour));
    if include_category_analysis {
        sections.push_str(&table("Events by category", &aggregates.by_category));
    }

    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Audit Report</title>
<style>
body {{ font-family: sans-serif; margin: 2em; }}
table {{ border-collapse: collapse; margin-bottom: 2em; }}
th, td {{ border: 1px solid #ccc; padding: 4px 12px; text-align: left; }}
.summary span {{ display: inline-block; margin-right: 2em; }}
</style>
</head>
<body>
<h1>Audit Report (last {window_hours}h)</h1>
<p>Generated {generated}</p>
<div class="summary">
<span>Total: <b>{total}</b></span>
<span>High risk: <b>{high}</b></span>
<span>Medium risk: <b>{medium}</b></span>
<span>Low risk: <b>{low}</b></span>
<span>Failures: <b>{failed}</b></span>
<span>Compliance violations: <b>{violations}</b></span>
<span>Health: <b>{health}</b></span>
</div>
{sections}
</body>
</html>
"#,
        generated = Utc::now().to_rfc3339(),
        total = aggregates.total_events,
        high = aggregates.high_risk_events,
        medium = aggregates.medium_risk_events,
        low = aggregates.low_risk_events,
        failed = aggregates.failed_events,
        violations = aggregates.compliance_violations,
        health = system_health(aggregates),
    )
}

fn table(title: &str, pairs: &[(String, u64)]) -> String {
    let mut rows = String::new();
    for (key, count) in pairs {
        rows.push_str(&format!(
            "<tr><td>{}</td><td>{count}</td></tr>\n",
            html_escape(key)
        ));
    }
    format!("<h2>{title}</h2>\n<table><tr><th>Key</th><th>Count</th></tr>\n{rows}</table>\n")
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
