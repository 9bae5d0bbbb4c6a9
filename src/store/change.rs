//! Core data model: one submitted visual-edit request and its lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Immutable descriptor of the page element the user flagged.
///
/// Produced by the on-page picker; the server never mutates it after the
/// Change is created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementDescriptor {
    /// CSS selector that located the element
    pub selector: String,
    /// Lowercase tag name (e.g. "button")
    pub tag: String,
    /// DOM id attribute, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dom_id: Option<String>,
    /// Class list as captured by the picker
    #[serde(default)]
    pub classes: Vec<String>,
    /// Snapshot of relevant computed styles (property -> value)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub computed_styles: BTreeMap<String, String>,
    /// Source-file hint from framework devtools annotations, if available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_hint: Option<String>,
    /// Human-readable summary shown in the picker ("Primary CTA button")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Base64-encoded screenshot of the element region, if captured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
}

/// Lifecycle status of a Change.
///
/// `confirmed -> processing -> applied | failed`, with `failed -> processing`
/// on re-delivery. Older tables used "complete" for the success state; it is
/// accepted as an alias on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    /// Persisted and acknowledged to the client, not yet delivered
    Confirmed,
    /// An agent is working on it
    Processing,
    /// The agent reported success
    #[serde(alias = "complete")]
    Applied,
    /// The agent reported failure (retryable by client resubmission)
    Failed,
}

impl ChangeStatus {
    /// Statuses that `get_pending` returns when applied records are excluded.
    pub fn is_pending(self) -> bool {
        matches!(self, ChangeStatus::Confirmed | ChangeStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChangeStatus::Confirmed => "confirmed",
            ChangeStatus::Processing => "processing",
            ChangeStatus::Applied => "applied",
            ChangeStatus::Failed => "failed",
        }
    }
}

/// One requested visual edit, from submission through completion.
///
/// `element` and `feedback` are immutable once created; only the status
/// fields (`status`, `failure_reason`, `retry_count`) and the delivery
/// bookkeeping (`output_log`, `exit_code`, commit fields) mutate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub id: String,
    pub element: ElementDescriptor,
    /// Free-text instruction from the user
    pub feedback: String,
    /// Style property -> literal value pairs the picker already applied live
    #[serde(default)]
    pub visual_adjustments: BTreeMap<String, String>,
    /// CSS framework classification ("tailwind", "plain", ...)
    #[serde(default)]
    pub css_framework: String,
    pub timestamp: DateTime<Utc>,
    pub status: ChangeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    /// Project the agent should edit (its working directory)
    #[serde(default)]
    pub project_path: String,
    /// Page the element was flagged on
    #[serde(default)]
    pub page_url: String,
    /// Model requested by the client, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Captured agent stdout/stderr (subprocess delivery only)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output_log: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Commit hash extracted from the agent log, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_url: Option<String>,
}

impl Change {
    /// Create a freshly-submitted Change in the `confirmed` state.
    ///
    /// `id` is client-supplied when present, otherwise time-derived so that
    /// insertion order and id order agree.
    pub fn new(
        id: Option<String>,
        element: ElementDescriptor,
        feedback: String,
        project_path: String,
        page_url: String,
        model: Option<String>,
    ) -> Self {
        let id = id.unwrap_or_else(generate_change_id);
        Self {
            id,
            element,
            feedback,
            visual_adjustments: BTreeMap::new(),
            css_framework: String::new(),
            timestamp: Utc::now(),
            status: ChangeStatus::Confirmed,
            failure_reason: None,
            retry_count: 0,
            project_path,
            page_url,
            model,
            output_log: String::new(),
            exit_code: None,
            commit: None,
            commit_url: None,
        }
    }

    /// Compact summary used by `GET /tasks` and the `tasks` socket reply.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "feedback": self.feedback,
            "element": {
                "tag": self.element.tag,
                "selector": self.element.selector,
                "classes": self.element.classes,
            },
            "timestamp": self.timestamp.to_rfc3339(),
            "status": self.status.as_str(),
        })
    }
}

/// Time-derived id: `chg-<unix millis>-<short random suffix>`.
pub fn generate_change_id() -> String {
    let millis = Utc::now().timestamp_millis();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("chg-{}-{}", millis, &suffix[..6])
}
