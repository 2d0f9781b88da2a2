//! Structured (JSON) document enrichment.
//!
//! A parsed document is turned into six families of chunks: overview, schema,
//! entities, relationships, a flat `path = value` index and question/answer
//! entries. Every walk below is depth-bounded by [`MAX_WALK_DEPTH`]; anything
//! nested deeper is ignored rather than recursed into.

use serde_json::{Map, Value};

use crate::chunk::{ChunkKind, Segment};

pub const MAX_WALK_DEPTH: usize = 64;

const OVERVIEW_KEYS: usize = 10;
const COUNT_DEPTH: usize = 10;
const SCHEMA_DEPTH: usize = 2;
const SCHEMA_KEYS: usize = 20;
const INLINE_LIST_ITEMS: usize = 10;
const INDEX_LIST_ITEMS: usize = 5;
const RELATIONS_PER_CHUNK: usize = 20;
const INDEX_ENTRIES_PER_CHUNK: usize = 30;
const MAX_QA_ENTITIES: usize = 50;
const QA_PROPERTIES: usize = 10;

const ENTITY_KEYS: [&str; 5] = ["name", "id", "type", "title", "key"];
const ROOT_PATH: &str = "$";

pub fn preprocess_json(data: &Value, filename: &str, max_chunk_size: usize) -> Vec<Segment> {
    let mut segments = vec![
        Segment::new(ChunkKind::Overview, overview(data, filename)),
        Segment::new(ChunkKind::Schema, schema(data, filename)),
    ];
    segments.extend(entities(data, filename, max_chunk_size));
    segments.extend(relationships(data, filename));
    segments.extend(index(data, filename));
    segments.extend(qa(data, filename));
    segments
}

pub fn overview(data: &Value, filename: &str) -> String {
    let mut lines = vec![
        format!("Document: {}", filename),
        "Type: JSON Document".to_string(),
        String::new(),
    ];

    match data {
        Value::Object(map) => {
            let keys: Vec<&str> = map.keys().take(OVERVIEW_KEYS).map(String::as_str).collect();
            lines.push(format!("Top-level keys: {}", keys.join(", ")));
            lines.push(format!("Total top-level properties: {}", map.len()));
            lines.push(format!("Total nested items: {}", count_items(data, 0)));

            for (key, value) in map {
                if let Value::Array(items) = value {
                    if let Some(first) = items.first() {
                        let kind = if first.is_object() { "objects" } else { "values" };
                        lines.push(format!("  - {}: array of {} {}", key, items.len(), kind));
                    }
                }
            }
        }
        Value::Array(items) => {
            lines.push(format!("Root: Array with {} items", items.len()));
            if let Some(Value::Object(first)) = items.first() {
                let fields: Vec<&str> = first.keys().take(OVERVIEW_KEYS).map(String::as_str).collect();
                lines.push(format!("Item fields: {}", fields.join(", ")));
            }
        }
        scalar => lines.push(format!("Root: {} value", type_name(scalar))),
    }

    lines.join("\n")
}

fn count_items(value: &Value, depth: usize) -> usize {
    if depth > COUNT_DEPTH {
        return 0;
    }
    match value {
        Value::Object(map) => map.len() + map.values().map(|v| count_items(v, depth + 1)).sum::<usize>(),
        Value::Array(items) => items.len() + items.iter().map(|v| count_items(v, depth + 1)).sum::<usize>(),
        _ => 0,
    }
}

pub fn schema(data: &Value, filename: &str) -> String {
    let mut lines = vec![format!("Schema for {}:", filename), String::new()];

    match data {
        Value::Object(map) => describe_object(map, 0, &mut lines),
        Value::Array(items) => match items.first() {
            Some(Value::Object(first)) => {
                lines.push("[]: array of objects".to_string());
                describe_object(first, 1, &mut lines);
            }
            _ => lines.push("[]: array".to_string()),
        },
        scalar => lines.push(format!("(root): {}", type_name(scalar))),
    }

    lines.join("\n")
}

fn describe_object(map: &Map<String, Value>, indent: usize, lines: &mut Vec<String>) {
    let prefix = "  ".repeat(indent);

    for (key, value) in map.iter().take(SCHEMA_KEYS) {
        match value {
            Value::Object(inner) => {
                lines.push(format!("{}{}: object", prefix, key));
                if indent < SCHEMA_DEPTH {
                    describe_object(inner, indent + 1, lines);
                }
            }
            Value::Array(items) => match items.first() {
                Some(Value::Object(first)) => {
                    lines.push(format!("{}{}: array of objects", prefix, key));
                    if indent < SCHEMA_DEPTH {
                        describe_object(first, indent + 1, lines);
                    }
                }
                _ => lines.push(format!("{}{}: array", prefix, key)),
            },
            scalar => lines.push(format!("{}{}: {}", prefix, key, type_name(scalar))),
        }
    }
}

pub fn entities(data: &Value, filename: &str, max_chunk_size: usize) -> Vec<Segment> {
    let mut out = Vec::new();
    collect_entities(data, "", "", filename, max_chunk_size, 0, &mut out);
    out
}

fn collect_entities(
    value: &Value,
    path: &str,
    breadcrumb: &str,
    filename: &str,
    max_chunk_size: usize,
    depth: usize,
    out: &mut Vec<Segment>,
) {
    if depth > MAX_WALK_DEPTH {
        return;
    }

    match value {
        Value::Object(map) => {
            if ENTITY_KEYS.iter().any(|k| map.contains_key(*k)) {
                let name = label(map, &["name", "id", "title", "key"])
                    .unwrap_or_else(|| "unnamed".to_string());
                let text = render_entity(map, &name, path, breadcrumb, filename);

                if text.chars().count() <= max_chunk_size {
                    out.push(Segment {
                        text,
                        kind: ChunkKind::Entity,
                        path: Some(display_path(path).to_string()),
                        parent: (!breadcrumb.is_empty()).then(|| breadcrumb.to_string()),
                        entity: Some(name),
                    });
                }
            }

            let child_breadcrumb = match label(map, &["name", "id"]) {
                Some(own) if breadcrumb.is_empty() => own,
                Some(own) => format!("{} > {}", breadcrumb, own),
                None => breadcrumb.to_string(),
            };

            for (key, child) in map {
                if child.is_object() || child.is_array() {
                    collect_entities(
                        child,
                        &join_key(path, key),
                        &child_breadcrumb,
                        filename,
                        max_chunk_size,
                        depth + 1,
                        out,
                    );
                }
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                let item_path = match item.as_object().and_then(|m| label(m, &["name", "id"])) {
                    Some(name) if path.is_empty() => name,
                    Some(name) => format!("{}: {}", path, name),
                    None => format!("{}[{}]", path, i),
                };
                collect_entities(item, &item_path, breadcrumb, filename, max_chunk_size, depth + 1, out);
            }
        }
        _ => {}
    }
}

fn render_entity(
    map: &Map<String, Value>,
    name: &str,
    path: &str,
    breadcrumb: &str,
    filename: &str,
) -> String {
    let mut lines = vec![format!("[{}]", filename), format!("Path: {}", display_path(path))];
    if !breadcrumb.is_empty() {
        lines.push(format!("Context: {}", breadcrumb));
    }
    lines.push(format!("\nEntity: {}", name));
    lines.push("Properties:".to_string());

    for (key, value) in map {
        let rendered = match value {
            Value::Array(items) => match items.first() {
                Some(first) if !first.is_object() => items
                    .iter()
                    .take(INLINE_LIST_ITEMS)
                    .map(render_scalar)
                    .collect::<Vec<_>>()
                    .join(", "),
                _ => format!("[{} items]", items.len()),
            },
            Value::Object(_) => "[object]".to_string(),
            scalar => render_scalar(scalar),
        };
        lines.push(format!("  {}: {}", key, rendered));
    }

    lines.join("\n")
}

pub fn relationships(data: &Value, filename: &str) -> Vec<Segment> {
    let mut relations = Vec::new();
    collect_relationships(data, None, 0, &mut relations);

    relations
        .chunks(RELATIONS_PER_CHUNK)
        .map(|batch| {
            let lines: Vec<String> = batch.iter().map(|r| format!("  - {}", r)).collect();
            Segment::new(
                ChunkKind::Relationships,
                format!("[{}] Relationships:\n{}", filename, lines.join("\n")),
            )
        })
        .collect()
}

fn collect_relationships(value: &Value, parent: Option<&str>, depth: usize, out: &mut Vec<String>) {
    if depth > MAX_WALK_DEPTH {
        return;
    }

    match value {
        Value::Object(map) => {
            let current = label(map, &["name", "id"]);

            if let Some(current) = &current {
                if let Some(parent) = parent {
                    out.push(format!("{} contains {}", parent, current));
                }

                for (key, child) in map {
                    if let Value::String(target) = child {
                        if is_reference_key(key) {
                            out.push(format!("{} references {} (via {})", current, target, key));
                        }
                    }
                }
            }

            for child in map.values() {
                if child.is_object() || child.is_array() {
                    collect_relationships(child, current.as_deref(), depth + 1, out);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_relationships(item, parent, depth + 1, out);
            }
        }
        _ => {}
    }
}

/// Keys mentioning `id` or `ref` point at other records; a bare `id` is the
/// object's own identity.
fn is_reference_key(key: &str) -> bool {
    let lower = key.to_lowercase();
    lower != "id" && (lower.contains("id") || lower.contains("ref"))
}

pub fn index(data: &Value, filename: &str) -> Vec<Segment> {
    let mut entries = Vec::new();
    collect_index(data, "", 0, &mut entries);

    entries
        .chunks(INDEX_ENTRIES_PER_CHUNK)
        .map(|batch| {
            Segment::new(
                ChunkKind::Index,
                format!("[{}] Index:\n{}", filename, batch.join("\n")),
            )
        })
        .collect()
}

fn collect_index(value: &Value, path: &str, depth: usize, out: &mut Vec<String>) {
    if depth > MAX_WALK_DEPTH {
        return;
    }

    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let child_path = join_key(path, key);
                match child {
                    Value::Array(items) if items.first().is_some_and(|f| !f.is_object()) => {
                        let shown: Vec<String> =
                            items.iter().take(INDEX_LIST_ITEMS).map(render_scalar).collect();
                        let more = if items.len() > INDEX_LIST_ITEMS { "..." } else { "" };
                        out.push(format!("{} = [{}{}]", child_path, shown.join(", "), more));
                    }
                    Value::Object(_) | Value::Array(_) => {
                        collect_index(child, &child_path, depth + 1, out)
                    }
                    scalar => out.push(format!("{} = {}", child_path, render_scalar(scalar))),
                }
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                match item {
                    Value::Object(map) => {
                        let item_name = label(map, &["name", "id"]).unwrap_or_else(|| i.to_string());
                        collect_index(item, &format!("{}[{}]", path, item_name), depth + 1, out);
                    }
                    other => out.push(format!("{}[{}] = {}", path, i, render_scalar(other))),
                }
            }
        }
        _ => {}
    }
}

struct NamedEntity {
    name: String,
    path: String,
    entity_type: String,
    properties: Vec<String>,
}

pub fn qa(data: &Value, filename: &str) -> Vec<Segment> {
    let mut named = Vec::new();
    collect_named(data, "", 0, &mut named);

    named
        .into_iter()
        .take(MAX_QA_ENTITIES)
        .map(|entity| {
            let properties: Vec<&str> = entity
                .properties
                .iter()
                .take(QA_PROPERTIES)
                .map(String::as_str)
                .collect();
            let text = format!(
                "[{}] What is {}?\nAnswer: {} is a {} located at {}.\nProperties: {}",
                filename,
                entity.name,
                entity.name,
                entity.entity_type,
                display_path(&entity.path),
                properties.join(", ")
            );
            Segment {
                text,
                kind: ChunkKind::Qa,
                path: Some(display_path(&entity.path).to_string()),
                parent: None,
                entity: Some(entity.name),
            }
        })
        .collect()
}

fn collect_named(value: &Value, path: &str, depth: usize, out: &mut Vec<NamedEntity>) {
    if depth > MAX_WALK_DEPTH {
        return;
    }

    match value {
        Value::Object(map) => {
            if let Some(name) = label(map, &["name", "id", "title"]) {
                out.push(NamedEntity {
                    name,
                    path: path.to_string(),
                    entity_type: label(map, &["type", "kind"]).unwrap_or_else(|| "entity".to_string()),
                    properties: map
                        .iter()
                        .filter(|(_, v)| !v.is_object() && !v.is_array())
                        .map(|(k, _)| k.clone())
                        .collect(),
                });
            }

            for (key, child) in map {
                if child.is_object() || child.is_array() {
                    collect_named(child, &join_key(path, key), depth + 1, out);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_named(item, path, depth + 1, out);
            }
        }
        _ => {}
    }
}

/// First of `keys` holding a meaningful scalar (non-empty, non-zero, non-false).
fn label(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match map.get(*key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) if n.as_f64() != Some(0.0) => Some(n.to_string()),
        Value::Bool(true) => Some("true".to_string()),
        _ => None,
    })
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn join_key(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", path, key)
    }
}

fn display_path(path: &str) -> &str {
    if path.is_empty() { ROOT_PATH } else { path }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "company": "Acme",
            "tags": ["b2b", "saas"],
            "departments": [
                {
                    "name": "Engineering",
                    "type": "department",
                    "manager_id": "u-1",
                    "teams": [
                        {"name": "Platform", "size": 4},
                        {"name": "Data", "size": 3}
                    ]
                },
                {"id": "sales", "budget": 1.5}
            ],
            "office": {"city": "Berlin", "floors": [1, 2, 3, 4, 5, 6]}
        })
    }

    #[test]
    fn test_overview() {
        let text = overview(&sample(), "acme.json");

        assert!(text.starts_with("Document: acme.json\nType: JSON Document\n"));
        assert!(text.contains("Top-level keys: company, tags, departments, office"));
        assert!(text.contains("Total top-level properties: 4"));
        assert!(text.contains("  - tags: array of 2 values"));
        assert!(text.contains("  - departments: array of 2 objects"));
    }

    #[test]
    fn test_root_array_overview() {
        let text = overview(&json!([{"a": 1, "b": 2}, {"a": 3}]), "rows.json");

        assert!(text.contains("Root: Array with 2 items"));
        assert!(text.contains("Item fields: a, b"));
    }

    #[test]
    fn test_schema_is_depth_capped() {
        let data = json!({"a": {"b": {"c": {"d": {"e": 1}}}}, "n": 1.5, "s": "x", "list": [1]});
        let text = schema(&data, "deep.json");

        assert!(text.contains("a: object\n  b: object\n    c: object"));
        assert!(!text.contains("d: object"));
        assert!(text.contains("n: number"));
        assert!(text.contains("s: string"));
        assert!(text.contains("list: array"));
    }

    #[test]
    fn test_schema_caps_keys_per_level() {
        let mut map = Map::new();
        for i in 0..30 {
            map.insert(format!("k{:02}", i), json!(i));
        }
        let text = schema(&Value::Object(map), "wide.json");

        assert_eq!(text.lines().count(), 2 + SCHEMA_KEYS);
    }

    #[test]
    fn test_entities_record_paths_and_breadcrumbs() {
        let segments = entities(&sample(), "acme.json", 800);

        let platform = segments
            .iter()
            .find(|s| s.entity.as_deref() == Some("Platform"))
            .expect("nested team is an entity");
        assert_eq!(platform.path.as_deref(), Some("departments: Engineering.teams: Platform"));
        assert_eq!(platform.parent.as_deref(), Some("Engineering"));
        assert!(platform.text.contains("Context: Engineering"));
        assert!(platform.text.contains("  size: 4"));

        let engineering = segments
            .iter()
            .find(|s| s.entity.as_deref() == Some("Engineering"))
            .unwrap();
        assert!(engineering.text.contains("  teams: [2 items]"));

        assert!(segments.iter().any(|s| s.entity.as_deref() == Some("sales")));
    }

    #[test]
    fn test_deeply_nested_named_object_is_found() {
        let data = json!({"company": {"team": {"lead": {"name": "Ada", "role": "cto"}}}});
        let segments = entities(&data, "org.json", 800);

        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].path.as_deref(), Some("company.team.lead"));
        assert!(segments[0].text.contains("Path: company.team.lead"));
    }

    #[test]
    fn test_oversized_entity_is_dropped() {
        let data = json!({"name": "big", "blob": "x".repeat(2000)});

        assert!(entities(&data, "big.json", 800).is_empty());
        assert_eq!(entities(&data, "big.json", 5000).len(), 1);
    }

    #[test]
    fn test_relationships() {
        let segments = relationships(&sample(), "acme.json");
        let text = &segments[0].text;

        assert!(text.starts_with("[acme.json] Relationships:\n"));
        assert!(text.contains("  - Engineering contains Platform"));
        assert!(text.contains("  - Engineering references u-1 (via manager_id)"));
        assert!(!text.contains("(via id)"));
    }

    #[test]
    fn test_relationship_chunks_are_bounded() {
        let children: Vec<Value> = (0..45).map(|i| json!({"name": format!("child{}", i)})).collect();
        let data = json!({"name": "root", "children": children});
        let segments = relationships(&data, "tree.json");

        assert_eq!(segments.len(), 3);
        for segment in &segments {
            let lines = segment.text.lines().filter(|l| l.starts_with("  - ")).count();
            assert!(lines <= RELATIONS_PER_CHUNK);
        }
    }

    #[test]
    fn test_index_entries() {
        let segments = index(&sample(), "acme.json");
        let text: String = segments.iter().map(|s| s.text.as_str()).collect::<Vec<_>>().join("\n");

        assert!(text.contains("company = Acme"));
        assert!(text.contains("tags = [b2b, saas]"));
        assert!(text.contains("departments[Engineering].teams[Platform].size = 4"));
        assert!(text.contains("departments[sales].budget = 1.5"));
        assert!(text.contains("office.floors = [1, 2, 3, 4, 5...]"));
    }

    #[test]
    fn test_index_chunks_are_bounded() {
        let mut map = Map::new();
        for i in 0..70 {
            map.insert(format!("field{}", i), json!(i));
        }
        let segments = index(&Value::Object(map), "flat.json");

        assert_eq!(segments.len(), 3);
        for segment in &segments {
            assert!(segment.text.lines().count() - 1 <= INDEX_ENTRIES_PER_CHUNK);
        }
    }

    #[test]
    fn test_qa_emits_every_entity() {
        let segments = qa(&sample(), "acme.json");

        assert_eq!(segments.len(), 4);
        assert_eq!(
            segments[0].text,
            "[acme.json] What is Engineering?\nAnswer: Engineering is a department located at departments.\nProperties: name, type, manager_id"
        );
        assert!(segments[1].text.contains("Platform is a entity located at departments.teams."));
    }

    #[test]
    fn test_qa_is_limited() {
        let items: Vec<Value> = (0..80).map(|i| json!({"id": format!("item{}", i)})).collect();
        assert_eq!(qa(&json!({"items": items}), "many.json").len(), MAX_QA_ENTITIES);
    }

    #[test]
    fn test_adversarial_nesting_does_not_overflow() {
        let mut value = json!({"name": "leaf"});
        for _ in 0..(MAX_WALK_DEPTH * 2) {
            value = json!({ "child": value });
        }
        let segments = preprocess_json(&value, "deep.json", 800);

        assert!(segments.iter().all(|s| s.entity.as_deref() != Some("leaf")));
        assert_eq!(segments[0].kind, ChunkKind::Overview);
    }
}
