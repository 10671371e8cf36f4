//! Content analysis and risk scoring. The keyword and rule sets are
//! injected at construction; the scoring contract is fixed, the lists are
//! deployment policy.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::events::{AuditEventType, EventDraft};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// Keywords that mark content as containing sensitive data.
    #[serde(default)]
    pub sensitive_keywords: Vec<String>,
    /// Keywords that mark content as risk-related; three or more hits rate
    /// the content high-risk, one or two medium.
    #[serde(default)]
    pub risk_keywords: Vec<String>,
    /// Category name -> keywords; a hit tags the event with the category.
    #[serde(default)]
    pub category_keywords: BTreeMap<String, Vec<String>>,
    /// Rule name -> required terms; content matching none of a rule's terms
    /// is flagged `missing_<rule>`.
    #[serde(default)]
    pub compliance_rules: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone)]
pub struct ContentAnalysis {
    pub categories: Vec<String>,
    pub risk_level: RiskLevel,
    pub compliance_issues: Vec<String>,
    pub sensitive_data_detected: bool,
}

pub struct ContentAnalyzer {
    config: AnalyzerConfig,
}

impl ContentAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    pub fn analyze(&self, content: &str) -> ContentAnalysis {
        let content_lower = content.to_lowercase();
        let contains = |keyword: &String| content_lower.contains(&keyword.to_lowercase());

        let categories: Vec<String> = self
            .config
            .category_keywords
            .iter()
            .filter(|(_, keywords)| keywords.iter().any(contains))
            .map(|(name, _)| name.clone())
            .collect();

        let risk_hits = self.config.risk_keywords.iter().filter(|k| contains(k)).count();
        let risk_level = if risk_hits >= 3 {
            RiskLevel::High
        } else if risk_hits >= 1 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        let sensitive_data_detected = self.config.sensitive_keywords.iter().any(contains);

        let compliance_issues: Vec<String> = self
            .config
            .compliance_rules
            .iter()
            .filter(|(_, terms)| !terms.iter().any(contains))
            .map(|(rule, _)| format!("missing_{rule}"))
            .collect();

        ContentAnalysis {
            categories,
            risk_level,
            compliance_issues,
            sensitive_data_detected,
        }
    }
}

/// Deterministic risk score in 0..=100: a base per event type, adjusted by
/// the content analysis and the failure markers on the draft.
pub fn risk_score(draft: &EventDraft, analysis: Option<&ContentAnalysis>) -> u8 {
    let base: u32 = match draft.event_type {
        AuditEventType::UserSessionStart => 10,
        AuditEventType::DocumentUpload => 30,
        AuditEventType::DocumentAccess => 25,
        AuditEventType::RagQuery => 20,
        AuditEventType::RagSearch => 15,
        AuditEventType::AgentMessage => 15,
        AuditEventType::FinancialDataAccess => 50,
        AuditEventType::RiskAssessmentQuery => 40,
        AuditEventType::ProductInfoQuery => 30,
        AuditEventType::ComplianceCheck => 35,
        AuditEventType::SystemError => 60,
        AuditEventType::Authentication => 25,
        _ => 15,
    };

    let mut score = base;
    if let Some(analysis) = analysis {
        if analysis.sensitive_data_detected {
            score += 30;
        }
        match analysis.risk_level {
            RiskLevel::High => score += 25,
            RiskLevel::Medium => score += 15,
            RiskLevel::Low => {}
        }
        if !analysis.compliance_issues.is_empty() {
            score += 20;
        }
    }
    if !draft.success {
        score += 25;
    }
    if draft
        .details
        .get("failed_attempts")
        .and_then(|v| v.as_u64())
        .unwrap_or(0)
        > 2
    {
        score += 20;
    }
    if draft
        .details
        .get("bulk_operation")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        score += 15;
    }

    score.min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::AuditLevel;

    fn analyzer() -> ContentAnalyzer {
        let mut category_keywords = BTreeMap::new();
        category_keywords.insert("product_info".to_string(), vec!["yield".into(), "fund".into()]);
        let mut compliance_rules = BTreeMap::new();
        compliance_rules.insert(
            "risk_disclosure".to_string(),
            vec!["risk disclosure".into(), "investment risk".into()],
        );
        ContentAnalyzer::new(AnalyzerConfig {
            sensitive_keywords: vec!["account number".into(), "password".into()],
            risk_keywords: vec!["risk".into(), "loss".into(), "volatility".into()],
            category_keywords,
            compliance_rules,
        })
    }

    #[test]
    fn empty_config_is_neutral() {
        let analyzer = ContentAnalyzer::new(AnalyzerConfig::default());
        let analysis = analyzer.analyze("anything at all");
        assert!(analysis.categories.is_empty());
        assert_eq!(analysis.risk_level, RiskLevel::Low);
        assert!(analysis.compliance_issues.is_empty());
        assert!(!analysis.sensitive_data_detected);
    }

    #[test]
    fn keyword_hits_set_category_and_risk() {
        let analysis =
            analyzer().analyze("This fund carries risk of loss and high volatility overall");
        assert_eq!(analysis.categories, vec!["product_info"]);
        assert_eq!(analysis.risk_level, RiskLevel::High);
        // no risk disclosure phrasing present
        assert_eq!(analysis.compliance_issues, vec!["missing_risk_disclosure"]);
    }

    #[test]
    fn sensitive_keyword_detected_case_insensitive() {
        let analysis = analyzer().analyze("Send me your Account Number");
        assert!(analysis.sensitive_data_detected);
    }

    #[test]
    fn base_scores_differ_by_type() {
        let query = EventDraft::new(AuditEventType::RagQuery, AuditLevel::Info, "query");
        let error = EventDraft::new(AuditEventType::SystemError, AuditLevel::Error, "boom");
        assert_eq!(risk_score(&query, None), 20);
        assert_eq!(risk_score(&error, None), 60);
    }

    #[test]
    fn failure_and_flags_stack_but_cap_at_100() {
        let analysis = ContentAnalysis {
            categories: vec![],
            risk_level: RiskLevel::High,
            compliance_issues: vec!["missing_x".into()],
            sensitive_data_detected: true,
        };
        let draft = EventDraft::new(
            AuditEventType::FinancialDataAccess,
            AuditLevel::Security,
            "export",
        )
        .details(serde_json::json!({ "failed_attempts": 5, "bulk_operation": true }))
        .failed("denied");
        // 50 + 30 + 25 + 20 + 25 + 20 + 15 = 185 -> capped
        assert_eq!(risk_score(&draft, Some(&analysis)), 100);
    }
}
