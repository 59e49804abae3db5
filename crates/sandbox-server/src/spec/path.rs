//! Compiled path-template matchers.
//!
//! Each OpenAPI path template (`/pets/{id}`) compiles to an anchored regex
//! that matches only the full path and captures variables in template
//! order. When several templates match one concrete path, the router
//! prefers the matcher with fewer capture variables and breaks ties by
//! longer literal template length, so `/pets/mine` binds before
//! `/pets/{id}`.

use crate::error::SpecError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

static VAR_SEGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

#[derive(Debug, Clone)]
pub struct PathTemplate {
    pub template: String,
    regex: Regex,
    /// Variable names in capture order.
    pub var_names: Vec<String>,
    /// Number of literal (non-variable) characters in the template.
    pub literal_len: usize,
}

impl PathTemplate {
    pub fn compile(template: &str) -> Result<Self, SpecError> {
        if !template.starts_with('/') {
            return Err(SpecError::BadPathTemplate {
                template: template.to_string(),
                reason: "must start with '/'".into(),
            });
        }

        let mut var_names = Vec::new();
        let mut pattern = String::from("^");
        let mut last = 0;
        for caps in VAR_SEGMENT.captures_iter(template) {
            let whole = caps.get(0).unwrap();
            let name = caps[1].to_string();
            if var_names.contains(&name) {
                return Err(SpecError::BadPathTemplate {
                    template: template.to_string(),
                    reason: format!("duplicate variable {{{name}}}"),
                });
            }
            pattern.push_str(&regex::escape(&template[last..whole.start()]));
            pattern.push_str("([^/]+)");
            var_names.push(name);
            last = whole.end();
        }
        pattern.push_str(&regex::escape(&template[last..]));
        pattern.push('$');

        // unmatched braces left over after variable extraction are malformed
        let remainder_has_brace = template[..]
            .char_indices()
            .filter(|(i, c)| {
                (*c == '{' || *c == '}')
                    && !VAR_SEGMENT
                        .find_iter(template)
                        .any(|m| m.start() <= *i && *i < m.end())
            })
            .count()
            > 0;
        if remainder_has_brace {
            return Err(SpecError::BadPathTemplate {
                template: template.to_string(),
                reason: "unbalanced braces".into(),
            });
        }

        let regex = Regex::new(&pattern).map_err(|e| SpecError::BadPathTemplate {
            template: template.to_string(),
            reason: e.to_string(),
        })?;
        let var_len: usize = VAR_SEGMENT
            .find_iter(template)
            .map(|m| m.end() - m.start())
            .sum();
        Ok(PathTemplate {
            template: template.to_string(),
            regex,
            var_names,
            literal_len: template.len() - var_len,
        })
    }

    /// Match a concrete path, returning captured variables by name.
    pub fn match_path(&self, path: &str) -> Option<HashMap<String, String>> {
        let caps = self.regex.captures(path)?;
        let mut vars = HashMap::with_capacity(self.var_names.len());
        for (i, name) in self.var_names.iter().enumerate() {
            vars.insert(name.clone(), caps.get(i + 1)?.as_str().to_string());
        }
        Some(vars)
    }

    /// Substitute variables back into the template (used by tests to
    /// verify round-tripping).
    pub fn render(&self, vars: &HashMap<String, String>) -> String {
        VAR_SEGMENT
            .replace_all(&self.template, |caps: &regex::Captures| {
                vars.get(&caps[1]).cloned().unwrap_or_default()
            })
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_template() {
        let t = PathTemplate::compile("/pets/mine").unwrap();
        assert!(t.match_path("/pets/mine").is_some());
        assert!(t.match_path("/pets/mine/extra").is_none());
        assert!(t.match_path("/pets").is_none());
        assert!(t.var_names.is_empty());
    }

    #[test]
    fn test_variable_capture() {
        let t = PathTemplate::compile("/users/{id}/posts/{postId}").unwrap();
        let vars = t.match_path("/users/42/posts/7").unwrap();
        assert_eq!(vars.get("id").map(String::as_str), Some("42"));
        assert_eq!(vars.get("postId").map(String::as_str), Some("7"));
        assert_eq!(t.var_names, vec!["id", "postId"]);
    }

    #[test]
    fn test_variables_do_not_cross_segments() {
        let t = PathTemplate::compile("/users/{id}").unwrap();
        assert!(t.match_path("/users/42/posts").is_none());
    }

    #[test]
    fn test_round_trip_variables() {
        let t = PathTemplate::compile("/a/{x}/b/{y}").unwrap();
        let mut vars = HashMap::new();
        vars.insert("x".to_string(), "alpha-1".to_string());
        vars.insert("y".to_string(), "beta_2".to_string());
        let path = t.render(&vars);
        assert_eq!(t.match_path(&path).unwrap(), vars);
    }

    #[test]
    fn test_inline_variable_in_segment() {
        let t = PathTemplate::compile("/files/{name}.json").unwrap();
        let vars = t.match_path("/files/report.json").unwrap();
        // greedy capture keeps the suffix out
        assert_eq!(vars.get("name").map(String::as_str), Some("report"));
    }

    #[test]
    fn test_literal_len_ranks_specificity() {
        let literal = PathTemplate::compile("/pets/mine").unwrap();
        let templated = PathTemplate::compile("/pets/{id}").unwrap();
        assert_eq!(literal.var_names.len(), 0);
        assert_eq!(templated.var_names.len(), 1);
        assert!(literal.literal_len > templated.literal_len);
    }

    #[test]
    fn test_duplicate_variable_rejected() {
        assert!(PathTemplate::compile("/a/{x}/b/{x}").is_err());
    }

    #[test]
    fn test_unbalanced_braces_rejected() {
        assert!(PathTemplate::compile("/a/{x").is_err());
        assert!(PathTemplate::compile("/a/x}").is_err());
    }

    #[test]
    fn test_must_start_with_slash() {
        assert!(PathTemplate::compile("pets").is_err());
    }
}
