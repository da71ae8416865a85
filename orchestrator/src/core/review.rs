//! Review verdict normalization and the checklist comment.

use crate::core::types::{ReviewResult, Verdict};
use crate::state::StoredReview;

/// Outcome after applying the PASS gate to a raw reviewer result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewOutcome {
    Pass,
    Rework,
}

/// A review passes iff the reviewer said PASS, the score clears the
/// threshold, and no critical items were reported. A PASS verdict with
/// critical items is downgraded to rework.
pub fn normalize(result: &ReviewResult, threshold: u32) -> ReviewOutcome {
    if result.verdict != Verdict::Pass {
        return ReviewOutcome::Rework;
    }
    if result.score < threshold {
        return ReviewOutcome::Rework;
    }
    if !result.critical_items.is_empty() {
        return ReviewOutcome::Rework;
    }
    ReviewOutcome::Pass
}

/// Does `current` patch revision accept a result recorded for `recorded`?
///
/// No current revision (no patch on disk) accepts anything; a current
/// revision requires an exact match.
pub fn revision_matches(current: Option<&str>, recorded: Option<&str>) -> bool {
    match current {
        None => true,
        Some(cur) => recorded == Some(cur),
    }
}

/// Render the review checklist comment posted when a result is consumed.
pub fn checklist_comment(result: &ReviewResult, threshold: u32) -> String {
    let mut lines: Vec<String> = Vec::new();
    let header = match &result.review_revision {
        Some(rev) => format!("Review checklist (rev {})", &rev[..rev.len().min(12)]),
        None => "Review checklist".to_string(),
    };
    let score_ok = result.score >= threshold;
    let verdict_ok = result.verdict == Verdict::Pass;

    lines.push(header);
    lines.push("- [x] Review completed".to_string());
    lines.push(format!(
        "- [{}] Score >= {} (score {})",
        if score_ok { 'x' } else { ' ' },
        threshold,
        result.score
    ));
    lines.push(format!(
        "- [{}] Verdict PASS (verdict {})",
        if verdict_ok { 'x' } else { ' ' },
        result.verdict.as_str()
    ));
    if result.critical_items.is_empty() {
        lines.push("- [x] No critical items found".to_string());
    } else {
        lines.push(format!(
            "- [ ] Critical items found ({})",
            result.critical_items.len()
        ));
        for item in result.critical_items.iter().take(10) {
            lines.push(format!("  - {item}"));
        }
    }
    let decision = if score_ok && verdict_ok && result.critical_items.is_empty() {
        "approve"
    } else {
        "request-changes"
    };
    lines.push(format!("- Recommendation: {decision}"));
    if !result.notes.is_empty() {
        lines.push(format!("- Notes: {}", result.notes));
    }
    if let Some(rev) = &result.review_revision {
        lines.push(format!("- Review revision: `{rev}`"));
    }
    lines.join("\n")
}

/// Stored form of a result (kept in state so the comment is posted once).
pub fn to_stored(result: &ReviewResult, now_ms: i64) -> StoredReview {
    StoredReview {
        score: result.score,
        verdict: result.verdict.as_str().to_string(),
        critical_items: result.critical_items.clone(),
        notes: result.notes.clone(),
        review_revision: result.review_revision.clone(),
        stored_at_ms: now_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(score: u32, verdict: Verdict, critical: &[&str]) -> ReviewResult {
        ReviewResult {
            score,
            verdict,
            critical_items: critical.iter().map(|s| s.to_string()).collect(),
            notes: "fine".to_string(),
            review_revision: Some("abcdef0123456789".to_string()),
        }
    }

    #[test]
    fn pass_requires_verdict_score_and_no_criticals() {
        assert_eq!(normalize(&result(95, Verdict::Pass, &[]), 90), ReviewOutcome::Pass);
        assert_eq!(
            normalize(&result(89, Verdict::Pass, &[]), 90),
            ReviewOutcome::Rework
        );
        assert_eq!(
            normalize(&result(95, Verdict::Rework, &[]), 90),
            ReviewOutcome::Rework
        );
        assert_eq!(
            normalize(&result(95, Verdict::Blocker, &[]), 90),
            ReviewOutcome::Rework
        );
    }

    #[test]
    fn critical_items_override_pass_verdict() {
        assert_eq!(
            normalize(&result(100, Verdict::Pass, &["oops"]), 90),
            ReviewOutcome::Rework
        );
    }

    #[test]
    fn revision_match_rules() {
        assert!(revision_matches(None, None));
        assert!(revision_matches(None, Some("a")));
        assert!(revision_matches(Some("a"), Some("a")));
        assert!(!revision_matches(Some("a"), Some("b")));
        assert!(!revision_matches(Some("a"), None));
    }

    #[test]
    fn checklist_reflects_gates() {
        let text = checklist_comment(&result(60, Verdict::Rework, &["broken test"]), 90);
        assert!(text.contains("[ ] Score >= 90 (score 60)"));
        assert!(text.contains("[ ] Verdict PASS (verdict REWORK)"));
        assert!(text.contains("Critical items found (1)"));
        assert!(text.contains("request-changes"));
        assert!(text.contains("rev abcdef012345"));

        let text = checklist_comment(&result(95, Verdict::Pass, &[]), 90);
        assert!(text.contains("[x] Score >= 90"));
        assert!(text.contains("approve"));
    }
}
