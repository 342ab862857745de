//! Deterministic identity hashing of declared plugin configurations.
//!
//! Two blocks declaring the same options (in any textual order) get the same
//! identity; any changed option or value produces a different one. The agent
//! uses the identity to recognize identical plugin instances across loads.

use sha2::{Digest, Sha256};

/// Computes the identity hash of one plugin block.
///
/// `plugin_name` is the qualified name (`"inputs.memcached"`). The declared
/// table is flattened to dotted keys (arrays of tables contribute an
/// index-bearing `key#N` segment so that position is part of the identity),
/// sorted, and fed to SHA-256 as NUL-terminated `key:value` pairs.
pub fn plugin_id(plugin_name: &str, table: &toml::Table) -> String {
    let mut pairs = Vec::new();
    flatten(String::new(), table, &mut pairs);
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    hasher.update(plugin_name.as_bytes());
    hasher.update([0u8]);
    for (key, value) in pairs {
        hasher.update(key.as_bytes());
        hasher.update(b":");
        hasher.update(value.as_bytes());
        hasher.update([0u8]);
    }
    hex_encode(hasher.finalize().as_slice())
}

fn flatten(prefix: String, table: &toml::Table, pairs: &mut Vec<(String, String)>) {
    for (key, value) in table {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            toml::Value::Table(sub) => flatten(path, sub, pairs),
            toml::Value::Array(items) if items.iter().all(toml::Value::is_table) && !items.is_empty() => {
                for (i, item) in items.iter().enumerate() {
                    if let toml::Value::Table(sub) = item {
                        flatten(format!("{path}#{i}"), sub, pairs);
                    }
                }
            }
            other => pairs.push((path, other.to_string())),
        }
    }
}

fn hex_encode(digest: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        // infallible on a String
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use pretty_assertions::{assert_eq, assert_ne};

    use super::*;

    fn table(s: &str) -> toml::Table {
        s.parse().unwrap()
    }

    #[test]
    fn key_order_does_not_matter() {
        let a = table(indoc! {r#"
            servers = ["localhost"]
            interval = "10s"
            [auth]
            user = "admin"
        "#});
        let b = table(indoc! {r#"
            [auth]
            user = "admin"
        "#});
        // reparse to get the remaining keys in a different declaration order
        let mut b = b;
        b.insert("interval".to_owned(), toml::Value::String("10s".to_owned()));
        b.insert("servers".to_owned(), toml::Value::Array(vec!["localhost".into()]));

        assert_eq!(plugin_id("inputs.memcached", &a), plugin_id("inputs.memcached", &b));
    }

    #[test]
    fn value_change_changes_identity() {
        let a = table(r#"servers = ["localhost"]"#);
        let b = table(r#"servers = ["127.0.0.1"]"#);
        assert_ne!(plugin_id("inputs.memcached", &a), plugin_id("inputs.memcached", &b));
    }

    #[test]
    fn plugin_name_is_part_of_identity() {
        let a = table(r#"interval = "10s""#);
        assert_ne!(plugin_id("inputs.cpu", &a), plugin_id("inputs.mem", &a));
    }

    #[test]
    fn array_of_tables_position_matters() {
        let a = table(indoc! {r#"
            [[rule]]
            action = "keep"
            [[rule]]
            action = "drop"
        "#});
        let b = table(indoc! {r#"
            [[rule]]
            action = "drop"
            [[rule]]
            action = "keep"
        "#});
        assert_ne!(plugin_id("processors.rules", &a), plugin_id("processors.rules", &b));
    }

    #[test]
    fn identity_is_hex_sha256() {
        let id = plugin_id("inputs.cpu", &toml::Table::new());
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
