//! Text preprocessing applied before the structural parser sees the file:
//! comment stripping and environment-variable substitution.

use std::env;

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SubstitutionError {
    /// A `${NAME?message}` or `${NAME:?message}` form fired.
    #[error("environment variable {name:?}: {message}")]
    Required { name: String, message: String },
}

/// Removes `#` comments from configuration text.
///
/// The scanner tracks quote and escape state so that a `#` inside a quoted
/// string is not taken for a comment start. Single- and double-quoted runs
/// end at the closing quote or at a newline; triple-quoted runs end only at
/// three matching quote characters and may span newlines.
pub fn strip_comments(input: &str) -> String {
    #[derive(PartialEq)]
    enum State {
        Normal,
        Single,
        Double,
        TripleSingle,
        TripleDouble,
        Comment,
    }

    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut state = State::Normal;
    let mut escaped = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match state {
            State::Normal => {
                if escaped {
                    out.push(c);
                    escaped = false;
                } else if c == '\\' {
                    out.push(c);
                    escaped = true;
                } else if c == '\'' || c == '"' {
                    if chars.get(i + 1) == Some(&c) && chars.get(i + 2) == Some(&c) {
                        out.push(c);
                        out.push(c);
                        out.push(c);
                        i += 2;
                        state = if c == '\'' { State::TripleSingle } else { State::TripleDouble };
                    } else {
                        out.push(c);
                        state = if c == '\'' { State::Single } else { State::Double };
                    }
                } else if c == '#' {
                    state = State::Comment;
                } else {
                    out.push(c);
                }
            }
            State::Single => {
                out.push(c);
                if c == '\'' || c == '\n' {
                    state = State::Normal;
                }
            }
            State::Double => {
                out.push(c);
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '"' || c == '\n' {
                    state = State::Normal;
                }
            }
            State::TripleSingle => {
                out.push(c);
                if c == '\'' && chars.get(i + 1) == Some(&'\'') && chars.get(i + 2) == Some(&'\'') {
                    out.push('\'');
                    out.push('\'');
                    i += 2;
                    state = State::Normal;
                }
            }
            State::TripleDouble => {
                if escaped {
                    out.push(c);
                    escaped = false;
                } else if c == '\\' {
                    out.push(c);
                    escaped = true;
                } else {
                    out.push(c);
                    if c == '"' && chars.get(i + 1) == Some(&'"') && chars.get(i + 2) == Some(&'"') {
                        out.push('"');
                        out.push('"');
                        i += 2;
                        state = State::Normal;
                    }
                }
            }
            State::Comment => {
                if c == '\n' {
                    out.push('\n');
                    state = State::Normal;
                }
            }
        }
        i += 1;
    }
    out
}

/// Substitutes `${NAME}` and `$NAME` patterns with environment variables.
///
/// Shell-style modifiers are supported: `${NAME:-default}` / `${NAME-default}`
/// fall back when the variable is empty-or-unset / unset, and
/// `${NAME:?message}` / `${NAME?message}` fail the load in those cases with
/// the given message. `$$` produces a literal `$`. Patterns that do not name
/// a valid variable (such as the regex-like `${1}`) are left verbatim.
pub fn substitute_env(input: &str) -> Result<String, SubstitutionError> {
    substitute(input, |name| env::var(name).ok())
}

pub(crate) fn substitute<F>(input: &str, lookup: F) -> Result<String, SubstitutionError>
where
    F: Fn(&str) -> Option<String>,
{
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'$' {
            // Copy everything up to the next '$' in one go.
            let next = input[i..].find('$').map(|p| i + p).unwrap_or(bytes.len());
            out.push_str(&input[i..next]);
            i = next;
            continue;
        }
        match bytes.get(i + 1) {
            Some(b'$') => {
                out.push('$');
                i += 2;
            }
            Some(b'{') => match input[i + 2..].find('}') {
                Some(rel_end) => {
                    let end = i + 2 + rel_end;
                    let inner = &input[i + 2..end];
                    match expand_braced(inner, &lookup)? {
                        Some(value) => out.push_str(&escape_for_quotes(&value)),
                        // Not a recognizable substitution, keep it verbatim.
                        None => out.push_str(&input[i..=end]),
                    }
                    i = end + 1;
                }
                None => {
                    // Unclosed brace, keep the rest verbatim.
                    out.push_str(&input[i..]);
                    break;
                }
            },
            _ => {
                let name_len = input[i + 1..]
                    .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
                    .unwrap_or(input.len() - i - 1);
                let name = &input[i + 1..i + 1 + name_len];
                if is_valid_name(name) {
                    if let Some(value) = lookup(name) {
                        out.push_str(&escape_for_quotes(&value));
                    }
                    i += 1 + name_len;
                } else {
                    out.push('$');
                    i += 1;
                }
            }
        }
    }
    Ok(out)
}

/// Expands the inside of a `${...}` pattern. Returns `None` when the pattern
/// is not a valid substitution and should stay verbatim.
fn expand_braced<F>(inner: &str, lookup: &F) -> Result<Option<String>, SubstitutionError>
where
    F: Fn(&str) -> Option<String>,
{
    let split = inner.find(|c| [':', '-', '?'].contains(&c)).unwrap_or(inner.len());
    let name = &inner[..split];
    if !is_valid_name(name) {
        return Ok(None);
    }
    let value = lookup(name);
    let modifier = &inner[split..];

    let expanded = if modifier.is_empty() {
        value.unwrap_or_default()
    } else if let Some(default) = modifier.strip_prefix(":-") {
        match value {
            Some(v) if !v.is_empty() => v,
            _ => default.to_owned(),
        }
    } else if let Some(default) = modifier.strip_prefix('-') {
        value.unwrap_or_else(|| default.to_owned())
    } else if let Some(message) = modifier.strip_prefix(":?") {
        match value {
            Some(v) if !v.is_empty() => v,
            _ => {
                return Err(SubstitutionError::Required {
                    name: name.to_owned(),
                    message: message.to_owned(),
                })
            }
        }
    } else if let Some(message) = modifier.strip_prefix('?') {
        match value {
            Some(v) => v,
            None => {
                return Err(SubstitutionError::Required {
                    name: name.to_owned(),
                    message: message.to_owned(),
                })
            }
        }
    } else {
        // Unknown modifier (e.g. "${NAME%x}"), keep the pattern verbatim.
        return Ok(None);
    };
    Ok(Some(expanded))
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Escapes a substituted value so it can safely land inside a quoted string.
fn escape_for_quotes(value: &str) -> String {
    if !value.contains(['\\', '"']) {
        return value.to_owned();
    }
    let mut escaped = String::with_capacity(value.len() + 2);
    for c in value.chars() {
        if c == '\\' || c == '"' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn comments_are_stripped() {
        let input = "a = 1 # trailing\n# full line\nb = 2\n";
        assert_eq!(strip_comments(input), "a = 1 \n\nb = 2\n");
    }

    #[test]
    fn hash_inside_quotes_survives() {
        let input = "password = \"pa#ss\" # comment\n";
        assert_eq!(strip_comments(input), "password = \"pa#ss\" \n");

        let input = "path = 'a#b'\n";
        assert_eq!(strip_comments(input), "path = 'a#b'\n");
    }

    #[test]
    fn triple_quotes_span_lines() {
        let input = "doc = '''\nline # not a comment\n''' # comment\n";
        assert_eq!(strip_comments(input), "doc = '''\nline # not a comment\n''' \n");

        let input = "doc = \"\"\"x # y\"\"\"\n";
        assert_eq!(strip_comments(input), "doc = \"\"\"x # y\"\"\"\n");
    }

    #[test]
    fn escaped_quote_in_double_quotes() {
        let input = "v = \"a\\\"# still a string\" # comment\n";
        assert_eq!(strip_comments(input), "v = \"a\\\"# still a string\" \n");
    }

    fn subst(input: &str) -> String {
        substitute(input, |name| match name {
            "SET" => Some("value".to_owned()),
            "EMPTY" => Some(String::new()),
            "QUOTED" => Some("a\"b\\c".to_owned()),
            _ => None,
        })
        .unwrap()
    }

    #[test]
    fn braced_and_bare_forms() {
        assert_eq!(subst("x = \"${SET}\""), "x = \"value\"");
        assert_eq!(subst("x = \"$SET\""), "x = \"value\"");
        assert_eq!(subst("pre${SET}post"), "prevaluepost");
    }

    #[test]
    fn unset_without_default_is_empty() {
        assert_eq!(subst("x = \"${UNSET}\""), "x = \"\"");
        assert_eq!(subst("x = \"$UNSET\""), "x = \"\"");
    }

    #[test]
    fn default_values() {
        assert_eq!(subst("${UNSET:-fallback}"), "fallback");
        assert_eq!(subst("${UNSET-fallback}"), "fallback");
        // ":-" also applies to empty values, "-" does not.
        assert_eq!(subst("${EMPTY:-fallback}"), "fallback");
        assert_eq!(subst("${EMPTY-fallback}"), "");
        assert_eq!(subst("${SET:-fallback}"), "value");
    }

    #[test]
    fn required_variables() {
        let err = substitute("${UNSET?var is required}", |_| None).unwrap_err();
        assert_eq!(
            err,
            SubstitutionError::Required {
                name: "UNSET".to_owned(),
                message: "var is required".to_owned(),
            }
        );

        let err = substitute("${EMPTY:?must not be empty}", |n| {
            (n == "EMPTY").then(String::new)
        })
        .unwrap_err();
        assert!(err.to_string().contains("must not be empty"));
    }

    #[test]
    fn invalid_patterns_stay_verbatim() {
        // Regex-like backreferences are not substitutions.
        assert_eq!(subst("grok = \"${1}\""), "grok = \"${1}\"");
        assert_eq!(subst("${SET%odd}"), "${SET%odd}");
        assert_eq!(subst("a $1 b"), "a $1 b");
        assert_eq!(subst("trailing $"), "trailing $");
        assert_eq!(subst("${UNCLOSED"), "${UNCLOSED");
    }

    #[test]
    fn dollar_dollar_escapes() {
        assert_eq!(subst("cost = \"$$5\""), "cost = \"$5\"");
        assert_eq!(subst("$${SET}"), "${SET}");
    }

    #[test]
    fn substituted_values_are_escaped_for_quotes() {
        assert_eq!(subst("x = \"${QUOTED}\""), "x = \"a\\\"b\\\\c\"");
    }
}
