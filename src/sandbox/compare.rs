use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::Finding;

/// Before/after comparison of one verification cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecheckResult {
    pub upload_id: String,
    pub original_findings: usize,
    pub remaining_findings: usize,
    pub fixed_findings: usize,
    pub new_findings: usize,
    /// `fixed / original * 100`, 0 when nothing was found originally
    pub success_rate: f64,
    pub fixed_ids: Vec<String>,
    pub new_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl RecheckResult {
    pub fn is_improvement(&self) -> bool {
        self.fixed_findings > 0 && self.new_findings == 0
    }

    pub fn to_human_string(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("\n  Recheck: {}\n  {}\n\n", self.upload_id, "=".repeat(40)));
        out.push_str(&format!("  Before:        {}\n", self.original_findings));
        out.push_str(&format!("  Remaining:     {}\n", self.remaining_findings));
        out.push_str(&format!("  Fixed:         {}\n", self.fixed_findings));
        out.push_str(&format!("  New:           {}\n", self.new_findings));
        out.push_str(&format!("  Success rate:  {:.1}%\n", self.success_rate));
        out
    }
}

/// Compare finding sets by identity.
///
/// fixed = before \ after, new = after \ before, remaining = before ∩ after.
/// New findings are never counted as remaining.
pub fn compare(upload_id: &str, before: &[Finding], after: &[Finding]) -> RecheckResult {
    let before_ids: BTreeSet<&str> = before.iter().map(Finding::id).collect();
    let after_ids: BTreeSet<&str> = after.iter().map(Finding::id).collect();

    let fixed_ids: Vec<String> = before_ids.difference(&after_ids).map(|s| s.to_string()).collect();
    let new_ids: Vec<String> = after_ids.difference(&before_ids).map(|s| s.to_string()).collect();
    let remaining = before_ids.intersection(&after_ids).count();

    let original = before_ids.len();
    let success_rate = if original == 0 {
        0.0
    } else {
        fixed_ids.len() as f64 / original as f64 * 100.0
    };

    RecheckResult {
        upload_id: upload_id.to_string(),
        original_findings: original,
        remaining_findings: remaining,
        fixed_findings: fixed_ids.len(),
        new_findings: new_ids.len(),
        success_rate,
        fixed_ids,
        new_ids,
        created_at: Utc::now(),
    }
}
