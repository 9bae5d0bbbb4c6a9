//! Per-element continuity store.
//!
//! Each page element the user has ever asked to edit gets a "bead": a short
//! history of what was requested and whether it worked. The bead travels
//! with every new prompt for the same element so the agent knows what has
//! already been tried.
//!
//! Subject identity is a pure function of the element's structural
//! descriptor, so independently-started processes derive the same id for
//! the same element without coordination.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::errors::StoreError;
use crate::store::change::ElementDescriptor;

/// History entries retained per bead. Appending past the cap drops the
/// oldest.
const HISTORY_CAP: usize = 10;

/// Entries rendered into the agent prompt context.
const CONTEXT_ENTRIES: usize = 3;

/// One recorded edit attempt against a subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeadEntry {
    pub task_id: String,
    pub feedback: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
}

/// Light element descriptor kept on the bead. Deliberately excludes the
/// style snapshot and screenshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeadElement {
    pub tag: String,
    pub selector: String,
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dom_id: Option<String>,
}

impl From<&ElementDescriptor> for BeadElement {
    fn from(element: &ElementDescriptor) -> Self {
        Self {
            tag: element.tag.clone(),
            selector: element.selector.clone(),
            classes: element.classes.clone(),
            dom_id: element.dom_id.clone(),
        }
    }
}

/// A subject's accumulated edit history, newest last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectBead {
    pub subject_id: String,
    pub element: BeadElement,
    pub changes: Vec<BeadEntry>,
}

/// Stable subject identity: hex SHA-256 prefix over tag, sorted class list,
/// DOM id, and selector. Class order as captured does not matter.
pub fn subject_id(element: &ElementDescriptor) -> String {
    let mut classes = element.classes.clone();
    classes.sort();

    let mut hasher = Sha256::new();
    hasher.update(element.tag.as_bytes());
    hasher.update(b"\x1f");
    for class in &classes {
        hasher.update(class.as_bytes());
        hasher.update(b"\x1f");
    }
    hasher.update(element.dom_id.as_deref().unwrap_or("").as_bytes());
    hasher.update(b"\x1f");
    hasher.update(element.selector.as_bytes());

    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}

/// File-backed bead store: one JSON file per subject id.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    dir: PathBuf,
}

impl MemoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load the bead for an element, or `None` if this subject has no
    /// recorded history. A corrupt bead file is treated as absent.
    pub fn load(&self, element: &ElementDescriptor) -> Option<SubjectBead> {
        let id = subject_id(element);
        let path = self.bead_path(&id);
        let raw = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(bead) => Some(bead),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Discarding corrupt bead");
                None
            }
        }
    }

    /// Append one outcome to the element's bead, creating it on first write.
    /// History is capped; the oldest entry is dropped past the cap.
    pub fn save(
        &self,
        element: &ElementDescriptor,
        feedback: &str,
        task_id: &str,
        success: bool,
    ) -> Result<SubjectBead, StoreError> {
        let id = subject_id(element);
        let mut bead = self.load(element).unwrap_or_else(|| SubjectBead {
            subject_id: id.clone(),
            element: BeadElement::from(element),
            changes: Vec::new(),
        });

        bead.changes.push(BeadEntry {
            task_id: task_id.to_string(),
            feedback: feedback.to_string(),
            timestamp: Utc::now(),
            success,
        });
        while bead.changes.len() > HISTORY_CAP {
            bead.changes.remove(0);
        }

        let path = self.bead_path(&id);
        let write_err = |source| StoreError::WriteFailed {
            path: path.clone(),
            source,
        };
        fs::create_dir_all(&self.dir).map_err(write_err)?;
        let json = serde_json::to_string_pretty(&bead)
            .map_err(|e| StoreError::Other(anyhow::anyhow!("serialize bead: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(write_err)?;
        fs::rename(&tmp, &path).map_err(write_err)?;
        Ok(bead)
    }

    fn bead_path(&self, subject_id: &str) -> PathBuf {
        self.dir.join(format!("{subject_id}.json"))
    }
}

/// Render the last few bead entries as human-readable context lines, or
/// `None` for an absent/empty bead.
///
/// One line per entry, oldest of the window first:
/// `2026-08-23 ✓ make the button blue`
pub fn format_context(bead: Option<&SubjectBead>) -> Option<String> {
    let bead = bead?;
    if bead.changes.is_empty() {
        return None;
    }
    let start = bead.changes.len().saturating_sub(CONTEXT_ENTRIES);
    let lines: Vec<String> = bead.changes[start..]
        .iter()
        .map(|entry| {
            let glyph = if entry.success { '\u{2713}' } else { '\u{2717}' };
            format!(
                "{} {} {}",
                entry.timestamp.format("%Y-%m-%d"),
                glyph,
                entry.feedback
            )
        })
        .collect();
    Some(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn element() -> ElementDescriptor {
        ElementDescriptor {
            selector: ".cta".to_string(),
            tag: "button".to_string(),
            dom_id: Some("buy".to_string()),
            classes: vec!["cta".to_string(), "primary".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn subject_id_is_stable_across_class_order() {
        let a = element();
        let mut b = element();
        b.classes = vec!["primary".to_string(), "cta".to_string()];
        assert_eq!(subject_id(&a), subject_id(&b));
    }

    #[test]
    fn subject_id_differs_for_different_elements() {
        let a = element();
        let mut b = element();
        b.tag = "a".to_string();
        assert_ne!(subject_id(&a), subject_id(&b));

        let mut c = element();
        c.dom_id = None;
        assert_ne!(subject_id(&a), subject_id(&c));
    }

    #[test]
    fn subject_id_is_short_hex() {
        let id = subject_id(&element());
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn load_unknown_subject_is_none() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        assert!(store.load(&element()).is_none());
    }

    #[test]
    fn save_creates_bead_lazily_and_load_roundtrips() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::new(dir.path());

        store.save(&element(), "make it blue", "chg-1", true).unwrap();
        let bead = store.load(&element()).unwrap();
        assert_eq!(bead.subject_id, subject_id(&element()));
        assert_eq!(bead.element.tag, "button");
        assert_eq!(bead.changes.len(), 1);
        assert!(bead.changes[0].success);
        assert_eq!(bead.changes[0].task_id, "chg-1");
    }

    #[test]
    fn history_is_capped_at_ten_dropping_oldest() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::new(dir.path());

        for i in 0..12 {
            store
                .save(&element(), &format!("edit {i}"), &format!("chg-{i}"), true)
                .unwrap();
        }
        let bead = store.load(&element()).unwrap();
        assert_eq!(bead.changes.len(), 10);
        assert_eq!(bead.changes[0].feedback, "edit 2");
        assert_eq!(bead.changes[9].feedback, "edit 11");
    }

    #[test]
    fn format_context_shows_last_three_newest_last() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::new(dir.path());

        for i in 0..5 {
            store
                .save(&element(), &format!("edit {i}"), &format!("chg-{i}"), i % 2 == 0)
                .unwrap();
        }
        let bead = store.load(&element()).unwrap();
        let context = format_context(Some(&bead)).unwrap();
        let lines: Vec<&str> = context.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("edit 2"));
        assert!(lines[2].contains("edit 4"));
    }

    #[test]
    fn format_context_marks_failures_with_cross() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::new(dir.path());

        store.save(&element(), "first try", "chg-1", false).unwrap();
        store.save(&element(), "second try", "chg-2", false).unwrap();

        let bead = store.load(&element()).unwrap();
        let context = format_context(Some(&bead)).unwrap();
        let lines: Vec<&str> = context.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains('\u{2717}') && lines[0].contains("first try"));
        assert!(lines[1].contains('\u{2717}') && lines[1].contains("second try"));
    }

    #[test]
    fn format_context_is_none_for_absent_or_empty_bead() {
        assert!(format_context(None).is_none());
        let empty = SubjectBead {
            subject_id: "abc".to_string(),
            element: BeadElement::from(&element()),
            changes: Vec::new(),
        };
        assert!(format_context(Some(&empty)).is_none());
    }

    #[test]
    fn beads_are_isolated_per_subject() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::new(dir.path());

        let other = ElementDescriptor {
            selector: ".hero".to_string(),
            tag: "div".to_string(),
            ..Default::default()
        };
        store.save(&element(), "button edit", "chg-1", true).unwrap();
        store.save(&other, "hero edit", "chg-2", false).unwrap();

        assert_eq!(store.load(&element()).unwrap().changes.len(), 1);
        assert_eq!(store.load(&other).unwrap().changes[0].feedback, "hero edit");
    }
}
