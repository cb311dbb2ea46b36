//! Tolerant JSON extraction from LLM output.
//!
//! Models routinely wrap the object in markdown fences or add prose around
//! it despite the prompt saying not to. Strategy: drop fence lines, try a
//! straight parse, then fall back to the first balanced `{…}` span.

pub fn parse_json_lenient(raw: &str) -> Option<serde_json::Value> {
    let cleaned: String = raw
        .lines()
        .filter(|l| !l.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n");
    let cleaned = cleaned.trim();

    if let Ok(v) = serde_json::from_str(cleaned) {
        return Some(v);
    }

    let span = balanced_object_span(cleaned)?;
    serde_json::from_str(span).ok()
}

/// First `{` through its matching `}`, string-literal aware.
fn balanced_object_span(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in s[start..].char_indices() {
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
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start..start + i + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_clean_json() {
        let v = parse_json_lenient(r#"{"event_type": "strike", "location": "Gaza"}"#).unwrap();
        assert_eq!(v["event_type"], "strike");
    }

    #[test]
    fn parses_json_with_markdown_fences() {
        let v = parse_json_lenient("```json\n{\"event_type\": \"rocket\"}\n```").unwrap();
        assert_eq!(v["event_type"], "rocket");
    }

    #[test]
    fn parses_json_with_surrounding_text() {
        let raw = "Here is the result:\n{\"event_type\": \"clash\", \"location\": \"Jenin\"}\nDone.";
        let v = parse_json_lenient(raw).unwrap();
        assert_eq!(v["event_type"], "clash");
    }

    #[test]
    fn parses_nested_object_with_braces_in_strings() {
        let raw = r#"note {"a": {"b": "x } y"}, "c": 1} trailing"#;
        let v = parse_json_lenient(raw).unwrap();
        assert_eq!(v["c"], 1);
        assert_eq!(v["a"]["b"], "x } y");
    }

    #[test]
    fn invalid_input_returns_none() {
        assert!(parse_json_lenient("this is not json at all").is_none());
        assert!(parse_json_lenient("{truncated").is_none());
    }
}
