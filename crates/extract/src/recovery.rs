//! Layered recovery of extraction data from model responses.
//!
//! Each strategy is a pure function from the raw response to a [`ParseAttempt`].
//! [`recover_extraction`] runs them in order and stops at the first success.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

use crate::error::{ParseFailure, truncate};
use crate::schema::RawExtraction;

#[derive(Debug)]
pub enum ParseAttempt {
    Parsed(RawExtraction),
    Failed(String),
}

pub type Strategy = fn(&str) -> ParseAttempt;

pub const STRATEGIES: &[(&str, Strategy)] = &[
    ("direct", parse_direct as Strategy),
    ("strip_fences", parse_without_fences as Strategy),
    ("balanced_object", parse_balanced_object as Strategy),
    ("repair", parse_repaired as Strategy),
    ("salvage_lists", salvage_lists as Strategy),
];

#[derive(Debug)]
pub struct Recovered {
    pub raw: RawExtraction,
    pub strategy: &'static str,
}

pub fn recover_extraction(response: &str) -> Result<Recovered, ParseFailure> {
    let mut attempts = Vec::with_capacity(STRATEGIES.len());

    for (name, strategy) in STRATEGIES {
        match strategy(response) {
            ParseAttempt::Parsed(raw) => {
                return Ok(Recovered {
                    raw,
                    strategy: *name,
                });
            }
            ParseAttempt::Failed(reason) => attempts.push((*name, reason)),
        }
    }

    Err(ParseFailure {
        attempts,
        preview: truncate(response, 500).to_string(),
    })
}

static TRAILING_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",(\s*[}\]])").expect("static regex"));
static ENTITIES_ARRAY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""entities"\s*:\s*\["#).expect("static regex"));
static RELATIONSHIPS_ARRAY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""(?:relationships|relations)"\s*:\s*\["#).expect("static regex")
});

fn take_array(map: &mut Map<String, Value>, keys: &[&str]) -> Option<Vec<Value>> {
    keys.iter().find_map(|key| match map.remove(*key) {
        Some(Value::Array(items)) => Some(items),
        _ => None,
    })
}

/// A parsed value counts only if it is an object carrying at least one of the lists.
fn interpret(value: Value) -> ParseAttempt {
    let Value::Object(mut map) = value else {
        return ParseAttempt::Failed("top-level value is not an object".to_string());
    };

    let entities = take_array(&mut map, &["entities"]);
    let relationships = take_array(&mut map, &["relationships", "relations"]);

    if entities.is_none() && relationships.is_none() {
        return ParseAttempt::Failed("object has no entities or relationships".to_string());
    }

    ParseAttempt::Parsed(RawExtraction {
        entities: entities.unwrap_or_default(),
        relationships: relationships.unwrap_or_default(),
    })
}

fn parse_json(text: &str) -> ParseAttempt {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => interpret(value),
        Err(e) => ParseAttempt::Failed(e.to_string()),
    }
}

pub fn parse_direct(response: &str) -> ParseAttempt {
    parse_json(response.trim())
}

pub fn parse_without_fences(response: &str) -> ParseAttempt {
    match fenced_body(response) {
        Some(body) => parse_json(body),
        None => ParseAttempt::Failed("no code fence".to_string()),
    }
}

pub fn parse_balanced_object(response: &str) -> ParseAttempt {
    let mut last = ParseAttempt::Failed("no balanced object".to_string());
    for candidate in balanced_objects(response) {
        match parse_json(candidate) {
            parsed @ ParseAttempt::Parsed(_) => return parsed,
            failed => last = failed,
        }
    }
    last
}

pub fn parse_repaired(response: &str) -> ParseAttempt {
    let body = fenced_body(response).unwrap_or(response);
    let Some(start) = body.find('{') else {
        return ParseAttempt::Failed("no object start".to_string());
    };

    let candidate = balanced_objects(body)
        .into_iter()
        .next()
        .unwrap_or(&body[start..]);

    parse_json(&repair_json(candidate))
}

pub fn salvage_lists(response: &str) -> ParseAttempt {
    let entities = salvage_array(response, &ENTITIES_ARRAY);
    let relationships = salvage_array(response, &RELATIONSHIPS_ARRAY);

    if entities.is_none() && relationships.is_none() {
        return ParseAttempt::Failed("no salvageable entities or relationships".to_string());
    }

    ParseAttempt::Parsed(RawExtraction {
        entities: entities.unwrap_or_default(),
        relationships: relationships.unwrap_or_default(),
    })
}

/// Body of the first markdown code fence; an unclosed fence runs to the end.
fn fenced_body(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after = &text[open + 3..];
    let tag_len = after
        .find(|c: char| !c.is_ascii_alphanumeric())
        .unwrap_or(after.len());
    let rest = &after[tag_len..];

    let body = match rest.find("```") {
        Some(close) => &rest[..close],
        None => rest,
    };
    Some(body.trim())
}

/// Balanced top-level `{...}` substrings, skipping braces inside strings.
fn balanced_objects(text: &str) -> Vec<&str> {
    let mut found = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        found.push(&text[s..=i]);
                    }
                }
            }
            _ => {}
        }
    }

    found
}

fn repair_json(candidate: &str) -> String {
    let lines_fixed = close_unterminated_lines(candidate);
    let without_trailing = TRAILING_COMMA.replace_all(&lines_fixed, "$1");
    let closed = close_open_structures(&without_trailing);
    TRAILING_COMMA.replace_all(&closed, "$1").into_owned()
}

fn unescaped_quotes(line: &str) -> usize {
    let mut count = 0;
    let mut escaped = false;
    for c in line.chars() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '"' => count += 1,
            _ => {}
        }
    }
    count
}

/// A JSON string cannot span lines, so an odd quote count marks an unterminated string.
fn close_unterminated_lines(text: &str) -> String {
    text.lines()
        .map(|line| {
            if unescaped_quotes(line) % 2 == 0 {
                return line.to_string();
            }
            let trimmed = line.trim_end();
            match trimmed.strip_suffix(',') {
                Some(head) => format!("{head}\","),
                None => format!("{trimmed}\""),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Closes whatever a truncated response left open: a string, a dangling key, brackets.
fn close_open_structures(text: &str) -> String {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut expect_key = false;
    let mut string_is_key = false;
    let mut pending_key = false;

    for c in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
                pending_key = string_is_key;
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                string_is_key = expect_key && stack.last() == Some(&'{');
                expect_key = false;
            }
            '{' | '[' => {
                stack.push(c);
                expect_key = c == '{';
                pending_key = false;
            }
            '}' | ']' => {
                stack.pop();
                expect_key = false;
                pending_key = false;
            }
            ':' => pending_key = false,
            ',' => expect_key = stack.last() == Some(&'{'),
            _ => {}
        }
    }

    let mut out = text.trim_end().to_string();
    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
        pending_key = string_is_key;
    }

    while out.ends_with(',') {
        out.pop();
        out.truncate(out.trim_end().len());
    }

    if pending_key {
        out.push_str(": null");
    } else if out.ends_with(':') {
        out.push_str(" null");
    }

    for open in stack.iter().rev() {
        out.push(if *open == '{' { '}' } else { ']' });
    }
    out
}

/// Pulls each complete object out of a named array, even when the rest is broken.
fn salvage_array(text: &str, key: &Regex) -> Option<Vec<Value>> {
    let m = key.find(text)?;
    let body = &text[m.end()..];

    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;
    let mut saw_content = false;
    let mut closed = false;

    for (i, c) in body.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        if !c.is_whitespace() && c != ']' {
            saw_content = true;
        }

        match c {
            '"' => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    let item = start.take().and_then(|s| {
                        serde_json::from_str::<Value>(&body[s..=i])
                            .ok()
                            .filter(Value::is_object)
                    });
                    items.extend(item);
                }
            }
            ']' if depth == 0 => {
                closed = true;
                break;
            }
            _ => {}
        }
    }

    let empty_array = closed && !saw_content;
    (!items.is_empty() || empty_array).then_some(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recovered(response: &str) -> Recovered {
        recover_extraction(response).expect("should recover")
    }

    const VALID: &str = r#"{"entities":[{"name":"Aspirin","type":"medication"}],"relationships":[{"source":"Aspirin","target":"Headache","type":"treats"}]}"#;

    #[test]
    fn test_direct_parse() {
        let r = recovered(VALID);
        assert_eq!(r.strategy, "direct");
        assert_eq!(r.raw.entities.len(), 1);
        assert_eq!(r.raw.relationships.len(), 1);
    }

    #[test]
    fn test_code_fences_are_stripped() {
        let r = recovered(&format!("```json\n{VALID}\n```"));
        assert_eq!(r.strategy, "strip_fences");

        let r = recovered(&format!("```{VALID}```"));
        assert_eq!(r.strategy, "strip_fences");
    }

    #[test]
    fn test_object_wrapped_in_prose() {
        let response = format!("Here is the extraction you asked for:\n{VALID}\nLet me know if you need more!");
        let r = recovered(&response);
        assert_eq!(r.strategy, "balanced_object");
        assert_eq!(r.raw.entities.len(), 1);
    }

    #[test]
    fn test_trailing_commas_repaired() {
        let response = r#"{"entities":[{"name":"Aspirin","type":"medication",},],"relationships":[],}"#;
        let r = recovered(response);
        assert_eq!(r.strategy, "repair");
        assert_eq!(r.raw.entities.len(), 1);
    }

    #[test]
    fn test_truncated_response_repaired() {
        let response = r#"{"entities":[{"name":"Aspirin","type":"medication"},{"name":"Headache","type":"cond"#;
        let r = recovered(response);
        assert_eq!(r.strategy, "repair");
        assert_eq!(r.raw.entities.len(), 2);
        assert_eq!(r.raw.entities[1]["type"], "cond");
    }

    #[test]
    fn test_truncated_inside_key() {
        let response = "{\"entities\": [{\"name\": \"Aspirin\", \"ty";
        let r = recovered(response);
        assert_eq!(r.strategy, "repair");
        assert_eq!(r.raw.entities[0]["name"], "Aspirin");
    }

    #[test]
    fn test_unterminated_string_mid_object() {
        let response = "{\n  \"entities\": [\n    {\"name\": \"Aspirin\", \"description\": \"pain relief,\n     \"type\": \"medication\"}\n  ]\n}";
        let r = recovered(response);
        assert_eq!(r.strategy, "repair");
        assert_eq!(r.raw.entities.len(), 1);
    }

    #[test]
    fn test_lists_salvaged_from_broken_outer_object() {
        let response = r#"{"entities": [{"name": "Aspirin", "type": "medication"}], "relationships": [{"source": "Aspirin" "target": "Headache"}]"#;
        let r = recovered(response);
        assert_eq!(r.strategy, "salvage_lists");
        assert_eq!(r.raw.entities.len(), 1);
        assert!(r.raw.relationships.is_empty());
    }

    #[test]
    fn test_unrecoverable_response_reports_every_strategy() {
        let err = recover_extraction("I'm sorry, I can't extract anything from this text.").unwrap_err();
        assert_eq!(err.attempts.len(), STRATEGIES.len());
        let names: Vec<_> = err.attempts.iter().map(|(name, _)| *name).collect();
        assert_eq!(names, vec!["direct", "strip_fences", "balanced_object", "repair", "salvage_lists"]);
    }

    #[test]
    fn test_object_without_lists_is_not_success() {
        assert!(recover_extraction(r#"{"answer": "none"}"#).is_err());
        assert!(recover_extraction("[1, 2, 3]").is_err());
    }

    #[test]
    fn test_relations_alias_accepted() {
        let r = recovered(r#"{"entities": [], "relations": [{"source": "A", "target": "B"}]}"#);
        assert_eq!(r.raw.relationships.len(), 1);
    }

    #[test]
    fn test_empty_lists_are_valid() {
        let r = recovered(r#"{"entities": [], "relationships": []}"#);
        assert!(r.raw.entities.is_empty());
        assert!(matches!(salvage_lists(r#"prefix "entities": [ ] suffix"#), ParseAttempt::Parsed(_)));
    }
}
