use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{CairnError, Result};

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").unwrap());

/// Replace all `${key}` tokens in the given SQL string.
///
/// Lookup is case-insensitive. If a token is not found in the map,
/// an error is returned listing the available tokens.
pub fn replace_tokens(sql: &str, tokens: &HashMap<String, String>) -> Result<String> {
    let lower_map: HashMap<String, &String> = tokens
        .iter()
        .map(|(k, v)| (k.to_lowercase(), v))
        .collect();

    let mut result = String::with_capacity(sql.len());
    let mut last_end = 0;

    for caps in TOKEN_RE.captures_iter(sql) {
        let (Some(full_match), Some(key)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let key = key.as_str();

        result.push_str(&sql[last_end..full_match.start()]);

        match lower_map.get(&key.to_lowercase()) {
            Some(value) => result.push_str(value),
            None => {
                let mut available: Vec<&str> = tokens.keys().map(|k| k.as_str()).collect();
                available.sort();
                return Err(CairnError::TokenNotFound {
                    key: key.to_string(),
                    available: if available.is_empty() {
                        "(none)".to_string()
                    } else {
                        available.join(", ")
                    },
                });
            }
        }

        last_end = full_match.end();
    }

    result.push_str(&sql[last_end..]);
    Ok(result)
}

/// Build the token map for one run: user tokens plus the `cairn:` built-ins.
///
/// `cairn:schema` is added per change when its SQL is rendered.
pub fn build_tokens(
    user_tokens: &HashMap<String, String>,
    user: &str,
    database: &str,
) -> HashMap<String, String> {
    let mut map = user_tokens.clone();
    map.insert("cairn:user".to_string(), user.to_string());
    map.insert("cairn:database".to_string(), database.to_string());
    map
}

/// Render `sql` for a change deployed into `schema`.
pub fn render_for_schema(sql: &str, tokens: &HashMap<String, String>, schema: &str) -> Result<String> {
    if !sql.contains("${") {
        return Ok(sql.to_string());
    }
    let mut scoped = tokens.clone();
    scoped.insert("cairn:schema".to_string(), schema.to_string());
    replace_tokens(sql, &scoped)
}
