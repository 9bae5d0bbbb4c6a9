//! Prompt rendering for agent delivery.
//!
//! Rendering is a pure function of (change, bead context, template). The
//! placeholder set is fixed and enumerated below; anything else in the
//! template that looks like a placeholder is left as literal text, so a
//! typo in a custom template is visible in the agent prompt instead of
//! silently vanishing.

use crate::store::change::Change;

/// The complete placeholder vocabulary. `{{NAME}}` syntax in templates.
pub const PLACEHOLDERS: &[&str] = &[
    "TASK_ID",
    "FEEDBACK",
    "TAG",
    "SELECTOR",
    "ELEMENT_ID",
    "CLASSES",
    "STYLES",
    "PAGE_URL",
    "HISTORY",
];

/// Built-in template used when no template file is configured.
pub const DEFAULT_TEMPLATE: &str = r#"A user flagged a visual change on a live web page. Apply it in the project source.

## REQUEST {{TASK_ID}}
{{FEEDBACK}}

## TARGET ELEMENT
- tag: {{TAG}}
- selector: {{SELECTOR}}
- id: {{ELEMENT_ID}}
- classes: {{CLASSES}}
- page: {{PAGE_URL}}

## COMPUTED STYLES
{{STYLES}}

## PREVIOUS EDITS TO THIS ELEMENT
{{HISTORY}}

Find the source of this element, make the requested change, and commit it.
"#;

/// Substitute the enumerated placeholders into `template`.
///
/// `history` is the rendered subject-bead context (or None when the element
/// has no recorded history).
pub fn render(change: &Change, history: Option<&str>, template: &str) -> String {
    let element = &change.element;
    let classes = if element.classes.is_empty() {
        "(none)".to_string()
    } else {
        element.classes.join(" ")
    };

    template
        .replace("{{TASK_ID}}", &change.id)
        .replace("{{FEEDBACK}}", &change.feedback)
        .replace("{{TAG}}", &element.tag)
        .replace("{{SELECTOR}}", &element.selector)
        .replace("{{ELEMENT_ID}}", element.dom_id.as_deref().unwrap_or("(none)"))
        .replace("{{CLASSES}}", &classes)
        .replace("{{STYLES}}", &style_summary(change))
        .replace("{{PAGE_URL}}", &change.page_url)
        .replace("{{HISTORY}}", history.unwrap_or("(no previous edits)"))
}

/// Render with the default template.
pub fn render_default(change: &Change, history: Option<&str>) -> String {
    render(change, history, DEFAULT_TEMPLATE)
}

/// Computed-style snapshot plus any live adjustments the picker already
/// applied, one `property: value` line each.
fn style_summary(change: &Change) -> String {
    let mut lines: Vec<String> = change
        .element
        .computed_styles
        .iter()
        .map(|(prop, value)| format!("- {prop}: {value}"))
        .collect();
    for (prop, value) in &change.visual_adjustments {
        lines.push(format!("- {prop}: {value} (adjusted live)"));
    }
    if lines.is_empty() {
        "(no style snapshot)".to_string()
    } else {
        lines.join("\n")
    }
}
