//! Workspace snapshot enrichment.
//!
//! A snapshot names the selected requirements on a
//! `Selected requirement RIDs:` line. Before a run, selected ids that have no
//! `RID — summary` line yet get one, fetched from the tool gateway in a
//! single `get_requirement` call.

use super::is_context_snapshot;
use serde_json::{Map, Value, json};
use std::collections::{HashMap, HashSet};
use taskloop_core::message::{Message, Role};
use taskloop_core::tool::ToolGateway;
use tracing::debug;

const SELECTED_LINE_PREFIX: &str = "Selected requirement RIDs:";
const SUMMARY_SEPARATOR: &str = " — ";
const LOOKUP_TOOL: &str = "get_requirement";

/// Append summary lines for selected ids to every snapshot in `context`.
/// Lookup failures leave the snapshot unchanged.
pub async fn enrich_snapshots(context: &mut [Message], tools: &dyn ToolGateway) {
    for message in context.iter_mut() {
        if message.role != Role::System || !is_context_snapshot(&message.content) {
            continue;
        }
        let missing = missing_ids(&message.content);
        if missing.is_empty() {
            continue;
        }
        let summaries = fetch_summaries(tools, &missing).await;
        let lines: Vec<String> = missing
            .iter()
            .filter_map(|id| summaries.get(id).map(|summary| format!("{id}{SUMMARY_SEPARATOR}{summary}")))
            .collect();
        if lines.is_empty() {
            continue;
        }
        debug!(added = lines.len(), "Enriched workspace context");
        let mut content = message.content.trim_end().to_string();
        content.push('\n');
        content.push_str(&lines.join("\n"));
        message.content = content;
    }
}

/// Selected ids, canonical and in order, that have no summary line yet.
fn missing_ids(content: &str) -> Vec<String> {
    let present: HashSet<&str> = content
        .lines()
        .filter_map(|line| line.split_once(SUMMARY_SEPARATOR))
        .map(|(id, _)| id.trim())
        .collect();
    selected_ids(content)
        .into_iter()
        .filter(|id| !present.contains(id.as_str()))
        .collect()
}

/// Ids listed on the first selection line. A placeholder such as
/// `(none)` selects nothing; malformed entries are skipped.
fn selected_ids(content: &str) -> Vec<String> {
    let Some(line) = content
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with(SELECTED_LINE_PREFIX))
    else {
        return Vec::new();
    };
    let listed = line[SELECTED_LINE_PREFIX.len()..].trim();
    if listed.is_empty() || listed.starts_with('(') {
        return Vec::new();
    }
    let mut ids: Vec<String> = Vec::new();
    for id in listed.split(',').filter_map(|part| canonical_id(part.trim())) {
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    ids
}

/// `SYS007` becomes `SYS7`. Ids are a letter-led prefix followed by digits.
fn canonical_id(raw: &str) -> Option<String> {
    let digits_from = raw.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    let (prefix, digits) = raw.split_at(digits_from);
    let mut chars = prefix.chars();
    let leads_with_letter = chars.next().is_some_and(|c| c.is_ascii_alphabetic());
    if !leads_with_letter || digits.is_empty() || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    let number = digits.trim_start_matches('0');
    Some(format!("{prefix}{}", if number.is_empty() { "0" } else { number }))
}

async fn fetch_summaries(tools: &dyn ToolGateway, ids: &[String]) -> HashMap<String, String> {
    let mut arguments = Map::new();
    arguments.insert("rid".into(), json!(ids));
    arguments.insert("fields".into(), json!(["title", "statement"]));
    let reply = match tools.call_tool(LOOKUP_TOOL, &arguments).await {
        Ok(reply) => reply,
        Err(err) => {
            debug!(error = %err, "Workspace context lookup failed");
            return HashMap::new();
        }
    };
    if reply.get("ok") != Some(&Value::Bool(true)) {
        return HashMap::new();
    }
    let Some(items) = reply.pointer("/result/items").and_then(Value::as_array) else {
        return HashMap::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let rid = item.get("rid")?.as_str()?.trim();
            let summary = ["statement", "title"]
                .iter()
                .filter_map(|key| item.get(*key).and_then(Value::as_str))
                .map(str::trim)
                .find(|text| !text.is_empty())?;
            (!rid.is_empty()).then(|| (rid.to_string(), summary.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_line_is_canonicalised() {
        let content = "[Workspace context]\nSelected requirement RIDs: SYS007, bad-id, HLR2, SYS7, 12, A1B2";
        assert_eq!(selected_ids(content), ["SYS7", "HLR2", "A1B2"]);
    }

    #[test]
    fn placeholder_selection_is_empty() {
        assert!(selected_ids("Selected requirement RIDs: (none)").is_empty());
        assert!(selected_ids("Selected requirement RIDs:").is_empty());
        assert!(selected_ids("[Workspace context]").is_empty());
    }

    #[test]
    fn ids_with_a_summary_line_are_not_missing() {
        let content = "[Workspace context]\nSelected requirement RIDs: SYS1, SYS2\nSYS1 — Telemetry";
        assert_eq!(missing_ids(content), ["SYS2"]);
    }

    #[test]
    fn canonical_id_requires_prefix_and_number() {
        assert_eq!(canonical_id("SYS000").as_deref(), Some("SYS0"));
        assert_eq!(canonical_id("Low_Level12").as_deref(), Some("Low_Level12"));
        assert_eq!(canonical_id("SYS"), None);
        assert_eq!(canonical_id("_SYS1"), None);
        assert_eq!(canonical_id("SYS 1"), None);
    }
}
