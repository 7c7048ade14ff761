//! Payload shaping for the Claude provider: system prompt injection,
//! cache-control budgeting, and internal-metadata scrubbing.

use serde_json::{Map, Value, json};
use tracing::{debug, warn};

/// Anthropic accepts at most this many cache_control markers across
/// system, messages and tools.
pub const MAX_CACHE_CONTROL_BLOCKS: usize = 4;

/// Marker on blocks ccproxy itself inserted, so downstream shaping knows to
/// keep them.
pub const INJECTED_MARKER: &str = "_ccproxy_injected";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemPromptInjectionMode {
    None,
    Minimal,
    #[default]
    Full,
}

/// Prepend the captured system prompt onto the request's `system` field.
/// `minimal` injects only the first captured block; injected blocks are
/// tagged with the private marker.
pub fn inject_system_prompt(
    mut body: Value,
    captured: &Value,
    mode: SystemPromptInjectionMode,
) -> Value {
    if mode == SystemPromptInjectionMode::None {
        return body;
    }
    let mut injected = mark_injected(captured);
    if mode == SystemPromptInjectionMode::Minimal {
        injected.truncate(1);
    }
    if injected.is_empty() {
        return body;
    }

    let Some(obj) = body.as_object_mut() else {
        return body;
    };
    let merged = match obj.remove("system") {
        None => injected,
        Some(Value::String(existing)) => {
            let mut blocks = injected;
            blocks.push(json!({"type": "text", "text": existing}));
            blocks
        }
        Some(Value::Array(existing)) => {
            let mut blocks = injected;
            blocks.extend(existing);
            blocks
        }
        Some(other) => {
            // Unrecognized system shape: leave it alone.
            obj.insert("system".to_string(), other);
            return body;
        }
    };
    obj.insert("system".to_string(), Value::Array(merged));
    body
}

/// Captured prompt data as a list of marked blocks.
fn mark_injected(captured: &Value) -> Vec<Value> {
    match captured {
        Value::String(text) => vec![json!({
            "type": "text",
            "text": text,
            INJECTED_MARKER: true,
        })],
        Value::Array(blocks) => blocks
            .iter()
            .map(|block| match block {
                Value::Object(fields) => {
                    let mut marked = fields.clone();
                    marked.insert(INJECTED_MARKER.to_string(), Value::Bool(true));
                    Value::Object(marked)
                }
                other => other.clone(),
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Remove every key starting with `_` recursively. Idempotent.
pub fn remove_metadata_fields(value: &Value) -> Value {
    match value {
        Value::Object(fields) => {
            let mut out = Map::new();
            for (key, value) in fields {
                if key.starts_with('_') {
                    continue;
                }
                out.insert(key.clone(), remove_metadata_fields(value));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(remove_metadata_fields).collect()),
        other => other.clone(),
    }
}

/// Where one cache_control marker lives inside the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum BlockLocation {
    System { block: usize },
    Message { message: usize, block: usize },
    Tool { tool: usize },
}

fn find_cache_control_blocks(body: &Value) -> Vec<BlockLocation> {
    let mut out = Vec::new();
    if let Some(system) = body.get("system").and_then(Value::as_array) {
        for (index, block) in system.iter().enumerate() {
            if block.get("cache_control").is_some() {
                out.push(BlockLocation::System { block: index });
            }
        }
    }
    if let Some(messages) = body.get("messages").and_then(Value::as_array) {
        for (message_index, message) in messages.iter().enumerate() {
            if let Some(content) = message.get("content").and_then(Value::as_array) {
                for (block_index, block) in content.iter().enumerate() {
                    if block.get("cache_control").is_some() {
                        out.push(BlockLocation::Message {
                            message: message_index,
                            block: block_index,
                        });
                    }
                }
            }
        }
    }
    if let Some(tools) = body.get("tools").and_then(Value::as_array) {
        for (index, tool) in tools.iter().enumerate() {
            if tool.get("cache_control").is_some() {
                out.push(BlockLocation::Tool { tool: index });
            }
        }
    }
    out
}

fn block_at<'a>(body: &'a Value, location: BlockLocation) -> Option<&'a Value> {
    match location {
        BlockLocation::System { block } => body.get("system")?.get(block),
        BlockLocation::Message { message, block } => {
            body.get("messages")?.get(message)?.get("content")?.get(block)
        }
        BlockLocation::Tool { tool } => body.get("tools")?.get(tool),
    }
}

fn block_at_mut(body: &mut Value, location: BlockLocation) -> Option<&mut Value> {
    match location {
        BlockLocation::System { block } => body.get_mut("system")?.get_mut(block),
        BlockLocation::Message { message, block } => body
            .get_mut("messages")?
            .get_mut(message)?
            .get_mut("content")?
            .get_mut(block),
        BlockLocation::Tool { tool } => body.get_mut("tools")?.get_mut(tool),
    }
}

/// Approximate content size in characters, for keep-the-largest ranking.
/// Structured values (tool `input` included) are measured through their
/// string rendering; the estimator is deliberately crude but deterministic.
fn content_size(block: &Value) -> usize {
    let Some(fields) = block.as_object() else {
        return 0;
    };
    let mut size = 0;
    if let Some(text) = fields.get("text").and_then(Value::as_str) {
        size += text.len();
    }
    if let Some(name) = fields.get("name").and_then(Value::as_str) {
        size += name.len();
    }
    if let Some(input) = fields.get("input") {
        size += input.to_string().len();
    }
    match fields.get("content") {
        Some(Value::String(content)) => size += content.len(),
        Some(Value::Array(items)) => {
            for item in items {
                match item {
                    Value::Object(_) => size += content_size(item),
                    other => size += other.to_string().len(),
                }
            }
        }
        _ => {}
    }
    for (key, value) in fields {
        if matches!(
            key.as_str(),
            "text" | "name" | "input" | "content" | "cache_control" | INJECTED_MARKER | "type"
        ) {
            continue;
        }
        match value {
            Value::String(s) => size += s.len(),
            other => size += other.to_string().len(),
        }
    }
    size
}

/// Enforce the cache_control budget: markers on injected blocks survive
/// unconditionally, the remaining slots go to the largest blocks, the rest
/// are stripped. Idempotent.
pub fn limit_cache_control_blocks(body: &Value, max_blocks: usize) -> Value {
    let mut body = body.clone();
    let locations = find_cache_control_blocks(&body);
    if locations.len() <= max_blocks {
        return body;
    }
    warn!(
        event = "cache_control_limit_exceeded",
        total_blocks = locations.len(),
        max_blocks
    );

    let mut injected = Vec::new();
    let mut ranked: Vec<(BlockLocation, usize)> = Vec::new();
    for location in &locations {
        let Some(block) = block_at(&body, *location) else {
            continue;
        };
        if block
            .get(INJECTED_MARKER)
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            injected.push(*location);
        } else {
            ranked.push((*location, content_size(block)));
        }
    }
    ranked.sort_by(|a, b| b.1.cmp(&a.1));

    let remaining_slots = max_blocks.saturating_sub(injected.len());
    let mut keep: Vec<BlockLocation> = injected;
    keep.extend(ranked.iter().take(remaining_slots).map(|(loc, _)| *loc));

    for location in locations {
        if keep.contains(&location) {
            continue;
        }
        if let Some(Value::Object(fields)) = block_at_mut(&mut body, location) {
            fields.remove("cache_control");
            debug!(event = "cache_control_stripped", location = ?location);
        }
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cached_text(text: &str, injected: bool) -> Value {
        let mut block = json!({
            "type": "text",
            "text": text,
            "cache_control": {"type": "ephemeral"},
        });
        if injected {
            block[INJECTED_MARKER] = Value::Bool(true);
        }
        block
    }

    fn count_markers(body: &Value) -> usize {
        find_cache_control_blocks(body).len()
    }

    #[test]
    fn injection_prepends_marked_blocks_before_existing_string() {
        let body = json!({"model": "m", "system": "existing"});
        let captured = json!([{"type": "text", "text": "captured"}]);
        let out = inject_system_prompt(body, &captured, SystemPromptInjectionMode::Full);
        let system = out["system"].as_array().unwrap();
        assert_eq!(system.len(), 2);
        assert_eq!(system[0]["text"], "captured");
        assert_eq!(system[0][INJECTED_MARKER], true);
        assert_eq!(system[1]["text"], "existing");
        assert!(system[1].get(INJECTED_MARKER).is_none());
    }

    #[test]
    fn minimal_mode_injects_only_first_block() {
        let body = json!({"model": "m"});
        let captured = json!([
            {"type": "text", "text": "first"},
            {"type": "text", "text": "second"}
        ]);
        let out = inject_system_prompt(body, &captured, SystemPromptInjectionMode::Minimal);
        let system = out["system"].as_array().unwrap();
        assert_eq!(system.len(), 1);
        assert_eq!(system[0]["text"], "first");
    }

    #[test]
    fn none_mode_is_a_no_op() {
        let body = json!({"model": "m", "system": "keep"});
        let out = inject_system_prompt(body.clone(), &json!("x"), SystemPromptInjectionMode::None);
        assert_eq!(out, body);
    }

    #[test]
    fn metadata_scrub_is_recursive_and_idempotent() {
        let body = json!({
            "model": "m",
            "_ccproxy_internal": 1,
            "system": [{"type": "text", "text": "t", INJECTED_MARKER: true}],
            "messages": [{
                "role": "user",
                "content": [{"type": "text", "text": "x", "_note": "private"}]
            }]
        });
        let once = remove_metadata_fields(&body);
        assert!(once.get("_ccproxy_internal").is_none());
        assert!(once["system"][0].get(INJECTED_MARKER).is_none());
        assert!(once["messages"][0]["content"][0].get("_note").is_none());
        assert_eq!(once["messages"][0]["content"][0]["text"], "x");
        assert_eq!(remove_metadata_fields(&once), once);
    }

    #[test]
    fn six_markers_prune_to_four_keeping_injected_and_largest() {
        let body = json!({
            "model": "m",
            "system": [
                cached_text("injected-one", true),
                cached_text("injected-two", true),
            ],
            "messages": [
                {"role": "user", "content": [
                    cached_text(&"L".repeat(400), false),
                    cached_text(&"M".repeat(300), false),
                    cached_text(&"s".repeat(20), false),
                    cached_text(&"t".repeat(10), false),
                ]}
            ]
        });
        let out = limit_cache_control_blocks(&body, MAX_CACHE_CONTROL_BLOCKS);
        assert_eq!(count_markers(&out), 4);
        // Injected markers survive untouched.
        assert!(out["system"][0].get("cache_control").is_some());
        assert!(out["system"][1].get("cache_control").is_some());
        // The two largest non-injected blocks keep theirs.
        assert!(out["messages"][0]["content"][0].get("cache_control").is_some());
        assert!(out["messages"][0]["content"][1].get("cache_control").is_some());
        // The small ones lost theirs but are otherwise intact.
        assert!(out["messages"][0]["content"][2].get("cache_control").is_none());
        assert_eq!(
            out["messages"][0]["content"][2]["text"].as_str().unwrap().len(),
            20
        );
    }

    #[test]
    fn limit_is_idempotent() {
        let body = json!({
            "model": "m",
            "messages": [{"role": "user", "content": [
                cached_text(&"a".repeat(50), false),
                cached_text(&"b".repeat(40), false),
                cached_text(&"c".repeat(30), false),
                cached_text(&"d".repeat(20), false),
                cached_text(&"e".repeat(10), false),
            ]}]
        });
        let once = limit_cache_control_blocks(&body, MAX_CACHE_CONTROL_BLOCKS);
        let twice = limit_cache_control_blocks(&once, MAX_CACHE_CONTROL_BLOCKS);
        assert_eq!(once, twice);
        assert_eq!(count_markers(&once), 4);
    }

    #[test]
    fn under_budget_payload_is_unchanged() {
        let body = json!({
            "model": "m",
            "tools": [
                {"name": "f", "input_schema": {}, "cache_control": {"type": "ephemeral"}}
            ]
        });
        assert_eq!(limit_cache_control_blocks(&body, 4), body);
    }

    #[test]
    fn tool_use_size_counts_stringified_input() {
        let block = json!({
            "type": "tool_use",
            "name": "fn",
            "input": {"key": "value"},
        });
        // 2 for the name plus the JSON rendering of the input object.
        let expected = 2 + json!({"key": "value"}).to_string().len();
        assert_eq!(content_size(&block), expected);
    }

    #[test]
    fn tools_markers_are_counted_in_the_budget() {
        let body = json!({
            "model": "m",
            "system": [cached_text("sys", false)],
            "tools": [
                {"name": "a", "cache_control": {"type": "ephemeral"}},
                {"name": "b", "cache_control": {"type": "ephemeral"}},
                {"name": "c", "cache_control": {"type": "ephemeral"}},
                {"name": "d", "cache_control": {"type": "ephemeral"}},
            ]
        });
        let out = limit_cache_control_blocks(&body, MAX_CACHE_CONTROL_BLOCKS);
        assert_eq!(count_markers(&out), 4);
    }
}
