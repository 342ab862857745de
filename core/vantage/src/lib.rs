//! Runtime core of the vantage telemetry agent.
//!
//! Vantage collects metrics through **input** plugins, reshapes them with
//! **processors** and **aggregators**, and publishes them through **output**
//! plugins. This crate is the part of the agent that turns a declarative
//! TOML configuration into a live, validated object graph:
//!
//! - [`config`]: the configuration engine, with multi-file loading,
//!   environment substitution, schema-driven field binding, unused-field
//!   detection, the `Duration`/`Size` scalar codecs, deterministic plugin
//!   identity and deprecation tracking.
//! - [`secrets`]: deferred-resolved secrets (`@{store:key}`) kept in
//!   wipeable, mlock-protected memory.
//! - [`filter`]: the glob-based metric filter attached to every block.
//! - [`plugin`]: the capability traits plugins implement, and the registry
//!   of factories the binder instantiates them from.
//! - [`models`]: running-plugin wrappers pairing an instance with its
//!   per-block metadata.
//!
//! The scheduling of collection and publishing, metric buffering and the
//! concrete wire formats live outside this crate.

pub mod config;
pub mod filter;
pub mod metric;
pub mod models;
pub mod plugin;
pub mod secrets;

use std::collections::BTreeMap;

/// The version of the running agent core.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Formats plugin names with multiplicity, e.g. `["cpu", "mem (2x)"]`,
/// sorted by name. Used in startup reports.
pub fn plugin_name_counts<'a, I: IntoIterator<Item = &'a str>>(names: I) -> Vec<String> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for name in names {
        *counts.entry(name).or_default() += 1;
    }
    counts
        .into_iter()
        .map(|(name, count)| {
            if count == 1 {
                name.to_owned()
            } else {
                format!("{name} ({count}x)")
            }
        })
        .collect()
}

/// Renders a tag map in `key=value` pairs separated by spaces, sorted by
/// key. Used in startup reports.
pub fn list_tags(tags: &BTreeMap<String, String>) -> String {
    tags.iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ")
}
