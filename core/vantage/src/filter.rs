//! Glob-based metric filtering attached to every plugin block.
//!
//! A [`Filter`] is built by the config binder from the `namepass`/`namedrop`,
//! `fieldpass`/`fielddrop`, `tagpass`/`tagdrop` and `taginclude`/`tagexclude`
//! options and must be compiled once before use. After compilation it is
//! immutable and safe to share between threads.

use std::collections::BTreeMap;

use globset::{Glob, GlobSet, GlobSetBuilder};
use thiserror::Error;

use crate::metric::Metric;

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("invalid glob {pattern:?} in {dimension}")]
    BadGlob {
        dimension: &'static str,
        pattern: String,
        #[source]
        source: globset::Error,
    },
    #[error("filter used before compilation")]
    NotCompiled,
}

/// Globs applying to the values of one tag key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagFilter {
    pub name: String,
    pub values: Vec<String>,
}

/// The declared (uncompiled) filter rules plus their compiled matchers.
#[derive(Debug, Default)]
pub struct Filter {
    pub name_pass: Vec<String>,
    pub name_drop: Vec<String>,
    pub field_pass: Vec<String>,
    pub field_drop: Vec<String>,
    pub tag_pass: Vec<TagFilter>,
    pub tag_drop: Vec<TagFilter>,
    pub tag_include: Vec<String>,
    pub tag_exclude: Vec<String>,

    compiled: Option<Compiled>,
}

#[derive(Debug)]
struct Compiled {
    name_pass: Option<GlobSet>,
    name_drop: Option<GlobSet>,
    field_pass: Option<GlobSet>,
    field_drop: Option<GlobSet>,
    tag_pass: Vec<(String, GlobSet)>,
    tag_drop: Vec<(String, GlobSet)>,
    tag_include: Option<GlobSet>,
    tag_exclude: Option<GlobSet>,
}

fn compile_globs(dimension: &'static str, patterns: &[String]) -> Result<Option<GlobSet>, FilterError> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|source| FilterError::BadGlob {
            dimension,
            pattern: pattern.clone(),
            source,
        })?;
        builder.add(glob);
    }
    let set = builder.build().map_err(|source| FilterError::BadGlob {
        dimension,
        pattern: patterns.join(", "),
        source,
    })?;
    Ok(Some(set))
}

fn compile_tag_globs(
    dimension: &'static str,
    filters: &[TagFilter],
) -> Result<Vec<(String, GlobSet)>, FilterError> {
    filters
        .iter()
        .map(|tf| {
            compile_globs(dimension, &tf.values).map(|set| {
                // An empty glob list compiles to a never-matching set.
                (tf.name.clone(), set.unwrap_or_else(GlobSet::empty))
            })
        })
        .collect()
}

impl Filter {
    /// Compiles every configured dimension. Must be called before any of the
    /// matching methods.
    pub fn compile(&mut self) -> Result<(), FilterError> {
        self.compiled = Some(Compiled {
            name_pass: compile_globs("namepass", &self.name_pass)?,
            name_drop: compile_globs("namedrop", &self.name_drop)?,
            field_pass: compile_globs("fieldpass", &self.field_pass)?,
            field_drop: compile_globs("fielddrop", &self.field_drop)?,
            tag_pass: compile_tag_globs("tagpass", &self.tag_pass)?,
            tag_drop: compile_tag_globs("tagdrop", &self.tag_drop)?,
            tag_include: compile_globs("taginclude", &self.tag_include)?,
            tag_exclude: compile_globs("tagexclude", &self.tag_exclude)?,
        });
        Ok(())
    }

    /// True when at least one dimension carries rules.
    pub fn is_active(&self) -> bool {
        !(self.name_pass.is_empty()
            && self.name_drop.is_empty()
            && self.field_pass.is_empty()
            && self.field_drop.is_empty()
            && self.tag_pass.is_empty()
            && self.tag_drop.is_empty()
            && self.tag_include.is_empty()
            && self.tag_exclude.is_empty())
    }

    fn compiled(&self) -> Result<&Compiled, FilterError> {
        self.compiled.as_ref().ok_or(FilterError::NotCompiled)
    }

    /// Checks the metric name against `namepass`/`namedrop`.
    pub fn matches_name(&self, name: &str) -> Result<bool, FilterError> {
        let c = self.compiled()?;
        if let Some(pass) = &c.name_pass {
            if !pass.is_match(name) {
                return Ok(false);
            }
        }
        if let Some(drop) = &c.name_drop {
            if drop.is_match(name) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Checks one field key against `fieldpass`/`fielddrop`.
    pub fn matches_field(&self, key: &str) -> Result<bool, FilterError> {
        let c = self.compiled()?;
        if let Some(pass) = &c.field_pass {
            if !pass.is_match(key) {
                return Ok(false);
            }
        }
        if let Some(drop) = &c.field_drop {
            if drop.is_match(key) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Checks the tag set against `tagpass`/`tagdrop`.
    ///
    /// `tagpass` requires, for every configured tag key, that the metric's
    /// value for that key match one of the key's globs; a metric lacking the
    /// key fails. `tagdrop` drops the metric as soon as one configured key's
    /// value matches.
    pub fn matches_tags(&self, tags: &BTreeMap<String, String>) -> Result<bool, FilterError> {
        let c = self.compiled()?;
        for (key, set) in &c.tag_pass {
            match tags.get(key) {
                Some(value) if set.is_match(value) => {}
                _ => return Ok(false),
            }
        }
        for (key, set) in &c.tag_drop {
            if let Some(value) = tags.get(key) {
                if set.is_match(value) {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Whether the metric passes the selection dimensions (name and tags).
    pub fn select(&self, metric: &Metric) -> Result<bool, FilterError> {
        Ok(self.matches_name(&metric.name)? && self.matches_tags(&metric.tags)?)
    }

    /// Applies the modifying dimensions in place: removes fields rejected by
    /// `fieldpass`/`fielddrop` and tags excluded by `taginclude`/`tagexclude`.
    pub fn modify(&self, metric: &mut Metric) -> Result<(), FilterError> {
        let c = self.compiled()?;
        if c.field_pass.is_some() || c.field_drop.is_some() {
            let mut kept = BTreeMap::new();
            for (key, value) in std::mem::take(&mut metric.fields) {
                if self.matches_field(&key)? {
                    kept.insert(key, value);
                }
            }
            metric.fields = kept;
        }
        if let Some(include) = &c.tag_include {
            metric.tags.retain(|key, _| include.is_match(key));
        }
        if let Some(exclude) = &c.tag_exclude {
            metric.tags.retain(|key, _| !exclude.is_match(key));
        }
        Ok(())
    }

    /// Full filter pass: selection, then modification. Returns `false` when
    /// the metric is rejected or loses all its fields.
    pub fn apply(&self, metric: &mut Metric) -> Result<bool, FilterError> {
        if !self.select(metric)? {
            return Ok(false);
        }
        self.modify(metric)?;
        Ok(!metric.fields.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::metric::Metric;

    fn compiled(mut f: Filter) -> Filter {
        f.compile().unwrap();
        f
    }

    #[test]
    fn uncompiled_filter_errors() {
        let f = Filter {
            name_pass: vec!["foo*".to_owned()],
            ..Default::default()
        };
        assert!(matches!(f.matches_name("foo"), Err(FilterError::NotCompiled)));
        assert!(matches!(
            f.matches_tags(&BTreeMap::new()),
            Err(FilterError::NotCompiled)
        ));
    }

    #[test]
    fn name_pass_and_drop() {
        let f = compiled(Filter {
            name_pass: vec!["foo*".to_owned(), "cpu".to_owned()],
            name_drop: vec!["foobar".to_owned()],
            ..Default::default()
        });
        assert!(f.matches_name("foothing").unwrap());
        assert!(f.matches_name("cpu").unwrap());
        assert!(!f.matches_name("bar").unwrap());
        // drop wins over pass
        assert!(!f.matches_name("foobar").unwrap());
    }

    #[test]
    fn empty_dimensions_pass_everything() {
        let f = compiled(Filter::default());
        assert!(!f.is_active());
        assert!(f.matches_name("anything").unwrap());
        assert!(f.matches_field("anything").unwrap());
        assert!(f.matches_tags(&BTreeMap::new()).unwrap());
    }

    #[test]
    fn bad_glob_fails_compilation() {
        let mut f = Filter {
            name_pass: vec!["a{".to_owned()],
            ..Default::default()
        };
        let err = f.compile().unwrap_err();
        assert!(err.to_string().contains("namepass"));
    }

    #[test]
    fn tag_pass_requires_every_key() {
        let f = compiled(Filter {
            tag_pass: vec![
                TagFilter {
                    name: "cpu".to_owned(),
                    values: vec!["cpu0".to_owned(), "cpu1".to_owned()],
                },
                TagFilter {
                    name: "host".to_owned(),
                    values: vec!["web*".to_owned()],
                },
            ],
            ..Default::default()
        });

        let mut tags = BTreeMap::new();
        tags.insert("cpu".to_owned(), "cpu0".to_owned());
        tags.insert("host".to_owned(), "web01".to_owned());
        assert!(f.matches_tags(&tags).unwrap());

        tags.insert("host".to_owned(), "db01".to_owned());
        assert!(!f.matches_tags(&tags).unwrap());

        // a missing configured key fails the pass dimension
        tags.remove("host");
        assert!(!f.matches_tags(&tags).unwrap());
    }

    #[test]
    fn tag_drop_rejects_on_any_match() {
        let f = compiled(Filter {
            tag_drop: vec![TagFilter {
                name: "state".to_owned(),
                values: vec!["idle".to_owned()],
            }],
            ..Default::default()
        });

        let mut tags = BTreeMap::new();
        tags.insert("state".to_owned(), "busy".to_owned());
        assert!(f.matches_tags(&tags).unwrap());
        tags.insert("state".to_owned(), "idle".to_owned());
        assert!(!f.matches_tags(&tags).unwrap());
        // absent key does not drop
        tags.clear();
        assert!(f.matches_tags(&tags).unwrap());
    }

    #[test]
    fn modify_filters_fields_and_tags() {
        let f = compiled(Filter {
            field_pass: vec!["usage_*".to_owned()],
            tag_exclude: vec!["pid".to_owned()],
            ..Default::default()
        });

        let mut metric = Metric::new("proc")
            .with_field("usage_user", 0.5)
            .with_field("uptime", 12i64)
            .with_tag("pid", "42")
            .with_tag("host", "web01");
        assert!(f.apply(&mut metric).unwrap());
        assert_eq!(metric.fields.keys().collect::<Vec<_>>(), vec!["usage_user"]);
        assert_eq!(metric.tags.keys().collect::<Vec<_>>(), vec!["host"]);
    }

    #[test]
    fn apply_drops_metric_with_no_fields_left() {
        let f = compiled(Filter {
            field_drop: vec!["*".to_owned()],
            ..Default::default()
        });
        let mut metric = Metric::new("m").with_field("a", 1i64);
        assert!(!f.apply(&mut metric).unwrap());
    }

    #[test]
    fn tag_include_keeps_only_matching_keys() {
        let f = compiled(Filter {
            tag_include: vec!["host".to_owned()],
            ..Default::default()
        });
        let mut metric = Metric::new("m")
            .with_field("a", 1i64)
            .with_tag("host", "h")
            .with_tag("rack", "r1");
        assert!(f.apply(&mut metric).unwrap());
        assert_eq!(metric.tags.keys().collect::<Vec<_>>(), vec!["host"]);
    }
}
