//! Running-plugin wrappers: a live plugin instance plus the per-block
//! runtime metadata (name, alias, filter, intervals) the binder built for it.

use std::collections::BTreeMap;

use crate::config::types::Duration;
use crate::filter::Filter;
use crate::metric::Metric;
use crate::plugin::{Aggregator, Input, Output, Parser, Processor, Serializer};

/// Common naming applied to metrics produced by a plugin.
fn rename(metric: &mut Metric, name_override: &str, prefix: &str, suffix: &str) {
    if !name_override.is_empty() {
        metric.name = name_override.to_owned();
    }
    if !prefix.is_empty() {
        metric.name = format!("{prefix}{}", metric.name);
    }
    if !suffix.is_empty() {
        metric.name.push_str(suffix);
    }
}

/// Adds tags that are not already present on the metric. Tags set by the
/// metric itself win over block-level tags.
fn merge_tags(metric: &mut Metric, tags: &BTreeMap<String, String>) {
    for (key, value) in tags {
        metric
            .tags
            .entry(key.clone())
            .or_insert_with(|| value.clone());
    }
}

#[derive(Debug, Default)]
pub struct InputConfig {
    pub name: String,
    pub alias: String,
    /// Content hash of the declared block.
    pub id: String,
    pub interval: Duration,
    pub precision: Duration,
    pub collection_jitter: Duration,
    pub collection_offset: Duration,
    pub name_override: String,
    pub name_prefix: String,
    pub name_suffix: String,
    pub tags: BTreeMap<String, String>,
    pub filter: Filter,
}

pub struct RunningInput {
    pub input: Box<dyn Input>,
    pub config: InputConfig,
    default_tags: BTreeMap<String, String>,
}

impl RunningInput {
    pub fn new(input: Box<dyn Input>, config: InputConfig) -> Self {
        RunningInput {
            input,
            config,
            default_tags: BTreeMap::new(),
        }
    }

    /// Installs the agent-wide tags (including `host`).
    pub fn set_default_tags(&mut self, tags: BTreeMap<String, String>) {
        self.default_tags = tags;
    }

    pub fn log_name(&self) -> String {
        log_name("inputs", &self.config.name, &self.config.alias)
    }

    /// Applies naming, tagging and filtering to a gathered metric.
    /// Returns `None` when the filter rejects it.
    pub fn make_metric(&self, mut metric: Metric) -> Option<Metric> {
        rename(
            &mut metric,
            &self.config.name_override,
            &self.config.name_prefix,
            &self.config.name_suffix,
        );
        merge_tags(&mut metric, &self.config.tags);
        merge_tags(&mut metric, &self.default_tags);
        match self.config.filter.apply(&mut metric) {
            Ok(true) => Some(metric),
            Ok(false) => None,
            Err(e) => {
                // Filters are compiled by the binder; an uncompiled filter
                // here is a bug, not a data condition.
                log::error!("{}: {e}", self.log_name());
                None
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct OutputConfig {
    pub name: String,
    pub alias: String,
    pub id: String,
    pub flush_interval: Duration,
    pub flush_jitter: Duration,
    pub metric_buffer_limit: usize,
    pub metric_batch_size: usize,
    pub name_override: String,
    pub name_prefix: String,
    pub name_suffix: String,
    pub filter: Filter,
}

pub struct RunningOutput {
    pub output: Box<dyn Output>,
    pub config: OutputConfig,
}

impl RunningOutput {
    pub fn new(output: Box<dyn Output>, config: OutputConfig) -> Self {
        RunningOutput { output, config }
    }

    pub fn log_name(&self) -> String {
        log_name("outputs", &self.config.name, &self.config.alias)
    }

    /// Whether this output accepts the metric.
    pub fn accepts(&self, metric: &Metric) -> bool {
        self.config.filter.select(metric).unwrap_or_else(|e| {
            log::error!("{}: {e}", self.log_name());
            false
        })
    }
}

#[derive(Debug, Default)]
pub struct ProcessorConfig {
    pub name: String,
    pub alias: String,
    pub id: String,
    /// Explicit pipeline position; unordered processors run first,
    /// in file order.
    pub order: Option<i64>,
    pub filter: Filter,
}

pub struct RunningProcessor {
    pub processor: Box<dyn Processor>,
    pub config: ProcessorConfig,
}

impl RunningProcessor {
    pub fn new(processor: Box<dyn Processor>, config: ProcessorConfig) -> Self {
        RunningProcessor { processor, config }
    }

    pub fn log_name(&self) -> String {
        log_name("processors", &self.config.name, &self.config.alias)
    }
}

#[derive(Debug, Default)]
pub struct AggregatorConfig {
    pub name: String,
    pub alias: String,
    pub id: String,
    pub period: Duration,
    pub delay: Duration,
    pub grace: Duration,
    pub drop_original: bool,
    pub name_override: String,
    pub name_prefix: String,
    pub name_suffix: String,
    pub tags: BTreeMap<String, String>,
    pub filter: Filter,
}

pub struct RunningAggregator {
    pub aggregator: Box<dyn Aggregator>,
    pub config: AggregatorConfig,
}

impl RunningAggregator {
    pub fn new(aggregator: Box<dyn Aggregator>, config: AggregatorConfig) -> Self {
        RunningAggregator { aggregator, config }
    }

    pub fn log_name(&self) -> String {
        log_name("aggregators", &self.config.name, &self.config.alias)
    }

    /// Applies naming and tagging to an aggregate produced by `push`.
    pub fn make_metric(&self, mut metric: Metric) -> Metric {
        rename(
            &mut metric,
            &self.config.name_override,
            &self.config.name_prefix,
            &self.config.name_suffix,
        );
        merge_tags(&mut metric, &self.config.tags);
        metric
    }
}

#[derive(Debug, Default)]
pub struct ParserConfig {
    /// Name of the plugin this parser was built for.
    pub parent: String,
    pub data_format: String,
}

pub struct RunningParser {
    pub parser: Box<dyn Parser>,
    pub config: ParserConfig,
}

impl RunningParser {
    pub fn new(parser: Box<dyn Parser>, config: ParserConfig) -> Self {
        RunningParser { parser, config }
    }

    pub fn parse(&mut self, data: &[u8]) -> anyhow::Result<Vec<Metric>> {
        self.parser.parse(data)
    }
}

#[derive(Debug, Default)]
pub struct SerializerConfig {
    pub parent: String,
    pub data_format: String,
}

pub struct RunningSerializer {
    pub serializer: Box<dyn Serializer>,
    pub config: SerializerConfig,
}

impl RunningSerializer {
    pub fn new(serializer: Box<dyn Serializer>, config: SerializerConfig) -> Self {
        RunningSerializer { serializer, config }
    }

    pub fn serialize(&mut self, metric: &Metric) -> anyhow::Result<Vec<u8>> {
        self.serializer.serialize(metric)
    }
}

fn log_name(category: &str, name: &str, alias: &str) -> String {
    if alias.is_empty() {
        format!("{category}.{name}")
    } else {
        format!("{category}.{name}::{alias}")
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::metric::Accumulator;

    struct NullInput;

    impl Input for NullInput {
        fn gather(&mut self, _acc: &mut dyn Accumulator) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn running_input(config: InputConfig) -> RunningInput {
        RunningInput::new(Box::new(NullInput), config)
    }

    #[test]
    fn log_names() {
        let ri = running_input(InputConfig {
            name: "memstats".to_owned(),
            ..Default::default()
        });
        assert_eq!(ri.log_name(), "inputs.memstats");

        let ri = running_input(InputConfig {
            name: "memstats".to_owned(),
            alias: "primary".to_owned(),
            ..Default::default()
        });
        assert_eq!(ri.log_name(), "inputs.memstats::primary");
    }

    #[test]
    fn make_metric_applies_naming_and_tags() {
        let mut config = InputConfig {
            name: "memstats".to_owned(),
            name_prefix: "dev_".to_owned(),
            name_suffix: "_v2".to_owned(),
            ..Default::default()
        };
        config.tags.insert("region".to_owned(), "eu".to_owned());
        config.filter.compile().unwrap();

        let mut ri = running_input(config);
        let mut host_tags = BTreeMap::new();
        host_tags.insert("host".to_owned(), "web01".to_owned());
        ri.set_default_tags(host_tags);

        let metric = Metric::new("usage").with_field("free", 1i64);
        let made = ri.make_metric(metric).unwrap();
        assert_eq!(made.name, "dev_usage_v2");
        assert_eq!(made.tags["region"], "eu");
        assert_eq!(made.tags["host"], "web01");
    }

    #[test]
    fn metric_tags_win_over_block_tags() {
        let mut config = InputConfig::default();
        config.tags.insert("region".to_owned(), "eu".to_owned());
        config.filter.compile().unwrap();
        let ri = running_input(config);

        let metric = Metric::new("m")
            .with_field("a", 1i64)
            .with_tag("region", "us");
        let made = ri.make_metric(metric).unwrap();
        assert_eq!(made.tags["region"], "us");
    }

    #[test]
    fn make_metric_respects_filter() {
        let mut config = InputConfig {
            name: "memstats".to_owned(),
            ..Default::default()
        };
        config.filter.name_drop = vec!["skip_*".to_owned()];
        config.filter.compile().unwrap();
        let ri = running_input(config);

        assert!(ri
            .make_metric(Metric::new("keep_this").with_field("a", 1i64))
            .is_some());
        assert!(ri
            .make_metric(Metric::new("skip_this").with_field("a", 1i64))
            .is_none());
    }
}
