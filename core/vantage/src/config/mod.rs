//! The configuration engine: loads declarative TOML documents and turns
//! them into a runtime object graph of live plugin instances.
//!
//! A load pass works through a fixed sequence per document: preprocess
//! (comment stripping, environment substitution), structural parse, bind the
//! `tags`/`global_tags` and `agent` tables, inject the `host` tag, then
//! dispatch every remaining top-level block to the matching plugin factory.
//! Any structural, type or unused-field error aborts the entire load; a
//! partially built [`Config`] must be discarded by the caller.

pub mod deprecation;
pub mod fetch;
mod id;
pub mod preprocess;
pub mod schema;
pub mod types;

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use indexmap::IndexSet;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::filter::{Filter, FilterError, TagFilter};
use crate::models::{
    AggregatorConfig, InputConfig, OutputConfig, ParserConfig, ProcessorConfig, RunningAggregator,
    RunningInput, RunningOutput, RunningParser, RunningProcessor, RunningSerializer,
    SerializerConfig,
};
use crate::plugin::registry::PluginRegistry;
use crate::secrets::{self, Secret, SecretError, SecretStore};

use deprecation::DeprecationLevel;
use fetch::FetchError;
use preprocess::SubstitutionError;

pub use id::plugin_id;
pub use types::{Duration, Size};

/// Data format used when an extensible input/output does not declare one.
const DEFAULT_DATA_FORMAT: &str = "plain";

/// Keys consumed by the binder itself on every plugin block. These are never
/// reported as unused and never bound onto the plugin instance.
const RESERVED_KEYS: &[&str] = &[
    "alias",
    "collection_jitter",
    "collection_offset",
    "data_format",
    "delay",
    "drop",
    "drop_original",
    "fielddrop",
    "fieldpass",
    "flush_interval",
    "flush_jitter",
    "grace",
    "id",
    "interval",
    "metric_batch_size",
    "metric_buffer_limit",
    "name_override",
    "name_prefix",
    "name_suffix",
    "namedrop",
    "namepass",
    "order",
    "pass",
    "period",
    "precision",
    "tagdrop",
    "tagexclude",
    "taginclude",
    "tagpass",
    "tags",
];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("error loading config file {path}")]
    InFile {
        path: String,
        #[source]
        source: Box<ConfigError>,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Substitution(#[from] SubstitutionError),
    /// Malformed document; the message carries line and column.
    #[error("invalid TOML: {0}")]
    Syntax(#[from] toml::de::Error),
    #[error("invalid configuration, bad table name {0:?}")]
    BadTable(String),
    #[error("unsupported config format for plugin {0:?}, expected an array of tables")]
    UnsupportedFormat(String),
    #[error("undefined but requested {category} plugin: {name}")]
    UnknownPlugin { category: &'static str, name: String },
    #[error("plugin {plugin}: line {line}: configuration specified the fields {fields:?}, but they weren't used")]
    UnusedFields {
        plugin: String,
        line: usize,
        fields: Vec<String>,
    },
    #[error("plugin {plugin}: line {line}: field {key:?}: {message}")]
    Field {
        plugin: String,
        line: usize,
        key: String,
        message: String,
    },
    #[error("plugin {plugin}: line {line}: {message}")]
    Bind {
        plugin: String,
        line: usize,
        message: String,
    },
    #[error("plugin {plugin}: {source}")]
    Filter {
        plugin: String,
        #[source]
        source: FilterError,
    },
    #[error("plugin {plugin} was deprecated in {since} and removed in {removal}: {notice}")]
    RemovedPlugin {
        plugin: String,
        since: String,
        removal: String,
        notice: String,
    },
    #[error("option {option:?} of plugin {plugin} was deprecated in {since} and removed in {removal}: {notice}")]
    RemovedOption {
        plugin: String,
        option: String,
        since: String,
        removal: String,
        notice: String,
    },
    #[error("{name:?} secret-store without id")]
    SecretStoreWithoutId { name: String },
    #[error("invalid secret-store id {id:?}, must only contain letters, numbers or underscore")]
    InvalidSecretStoreId { id: String },
    #[error("duplicate id {id:?} for secret-store {name:?}")]
    DuplicateSecretStoreId { id: String, name: String },
    #[error("error initializing secret-store {id:?}: {source}")]
    SecretStoreInit {
        id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Secret(#[from] SecretError),
    #[error("could not determine the hostname for the host tag")]
    Hostname,
}

/// Agent-wide settings bound from the `[agent]` table.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Default interval at which inputs gather.
    pub interval: Duration,
    /// Round collection to the interval, so a 10s interval collects at
    /// :00, :10, :20 and so on.
    pub round_interval: bool,
    /// Timestamp precision of collected metrics.
    pub precision: Duration,
    pub collection_jitter: Duration,
    pub collection_offset: Duration,
    pub flush_interval: Duration,
    pub flush_jitter: Duration,
    /// Maximum number of metrics sent to an output per write.
    pub metric_batch_size: usize,
    /// Maximum number of metrics buffered per output.
    pub metric_buffer_limit: usize,
    pub debug: bool,
    pub quiet: bool,
    /// "file" or "stderr".
    pub log_target: String,
    pub logfile: String,
    pub logfile_rotation_interval: Duration,
    pub logfile_rotation_max_size: Size,
    pub logfile_rotation_max_archives: i64,
    pub hostname: String,
    pub omit_hostname: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            interval: Duration::from_secs(10),
            round_interval: true,
            precision: Duration::ZERO,
            collection_jitter: Duration::ZERO,
            collection_offset: Duration::ZERO,
            flush_interval: Duration::from_secs(10),
            flush_jitter: Duration::ZERO,
            metric_batch_size: 1000,
            metric_buffer_limit: 10000,
            debug: false,
            quiet: false,
            log_target: "file".to_owned(),
            logfile: String::new(),
            logfile_rotation_interval: Duration::ZERO,
            logfile_rotation_max_size: Size::ZERO,
            logfile_rotation_max_archives: 5,
            hostname: String::new(),
            omit_hostname: false,
        }
    }
}

/// The root configuration aggregate: global tags, agent settings and the
/// collections of running plugins built from the loaded documents.
pub struct Config {
    registry: PluginRegistry,

    pub tags: BTreeMap<String, String>,
    pub agent: AgentConfig,

    /// When non-empty, only input plugins named here are activated.
    pub input_filters: Vec<String>,
    /// When non-empty, only output plugins named here are activated.
    pub output_filters: Vec<String>,
    /// When non-empty, only secret stores named here are activated.
    pub secret_store_filters: Vec<String>,

    pub inputs: Vec<RunningInput>,
    pub outputs: Vec<RunningOutput>,
    pub processors: Vec<RunningProcessor>,
    /// Second instances of every processor block, running after aggregation.
    pub agg_processors: Vec<RunningProcessor>,
    pub aggregators: Vec<RunningAggregator>,

    pub secret_stores: BTreeMap<String, Box<dyn SecretStore>>,
    unlinked_secrets: Vec<Secret>,

    /// Accumulated `[agent]` tables, merged across files before binding.
    agent_table: toml::Table,
}

impl Config {
    pub fn new(registry: PluginRegistry) -> Self {
        Config {
            registry,
            tags: BTreeMap::new(),
            agent: AgentConfig::default(),
            input_filters: Vec::new(),
            output_filters: Vec::new(),
            secret_store_filters: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            processors: Vec::new(),
            agg_processors: Vec::new(),
            aggregators: Vec::new(),
            secret_stores: BTreeMap::new(),
            unlinked_secrets: Vec::new(),
            agent_table: toml::Table::new(),
        }
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Loads every given source, then orders processors and links secrets.
    ///
    /// An empty slice loads the default configuration locations.
    pub fn load_all<S: AsRef<str>>(&mut self, sources: &[S]) -> Result<(), ConfigError> {
        if sources.is_empty() {
            for path in fetch::default_config_paths()? {
                self.load_config(&path)?;
            }
        } else {
            for source in sources {
                self.load_config(source.as_ref())?;
            }
        }

        // Order both processor pipelines by the declared `order` values,
        // keeping file position for ties and for unordered processors.
        sort_processors(&mut self.processors);
        sort_processors(&mut self.agg_processors);

        log::debug!("{} secret(s) in protected memory", secrets::secret_count());
        self.link_secrets()?;
        Ok(())
    }

    /// Loads one source: a file, a directory of `.conf` files, or a URL.
    pub fn load_config(&mut self, source: &str) -> Result<(), ConfigError> {
        let path = Path::new(source);
        if fetch::parse_url(source).is_none() && path.is_dir() {
            let files = fetch::walk_directory(path).map_err(|e| FetchError::Read {
                path: source.to_owned(),
                source: e,
            })?;
            for file in files {
                self.load_one(&file.to_string_lossy())?;
            }
            return Ok(());
        }
        self.load_one(source)
    }

    fn load_one(&mut self, source: &str) -> Result<(), ConfigError> {
        if !self.agent.quiet {
            log::info!("loading config: {source}");
        }
        let in_file = |e: ConfigError| ConfigError::InFile {
            path: source.to_owned(),
            source: Box::new(e),
        };
        let (text, _remote) = fetch::load_source(source).map_err(|e| in_file(e.into()))?;
        self.load_config_data(&text).map_err(in_file)
    }

    /// Links every collected secret against the registered secret stores.
    pub fn link_secrets(&self) -> Result<(), SecretError> {
        secrets::link_secrets(&self.unlinked_secrets, &self.secret_stores)
    }

    /// Parses and binds one TOML document.
    pub fn load_config_data(&mut self, data: &str) -> Result<(), ConfigError> {
        let text = preprocess::strip_comments(data);
        let text = preprocess::substitute_env(&text)?;
        let table = toml::Table::from_str(&text)?;
        let lines = LineIndex::build(&text);

        // Tags tables bind first so plugins can inherit them.
        for table_name in ["tags", "global_tags"] {
            if let Some(value) = table.get(table_name) {
                let tags = value
                    .as_table()
                    .ok_or_else(|| ConfigError::BadTable(table_name.to_owned()))?;
                for (key, value) in tags {
                    let value = value
                        .as_str()
                        .ok_or_else(|| ConfigError::BadTable(table_name.to_owned()))?;
                    self.tags.insert(key.clone(), value.to_owned());
                }
            }
        }

        if let Some(value) = table.get("agent") {
            let agent = value
                .as_table()
                .ok_or_else(|| ConfigError::BadTable("agent".to_owned()))?;
            merge_override(&mut self.agent_table, agent.clone());
            self.agent = toml::Value::Table(self.agent_table.clone())
                .try_into()
                .map_err(|e: toml::de::Error| ConfigError::Bind {
                    plugin: "agent".to_owned(),
                    line: lines.line("agent", 0),
                    message: e.to_string(),
                })?;
        }

        if !self.agent.omit_hostname {
            if self.agent.hostname.is_empty() {
                self.agent.hostname = os_hostname().ok_or(ConfigError::Hostname)?;
            }
            self.tags.insert("host".to_owned(), self.agent.hostname.clone());
        }

        // Processors keep their file position until the cross-file sort.
        let mut file_processors: Vec<(usize, RunningProcessor)> = Vec::new();
        let mut file_agg_processors: Vec<(usize, RunningProcessor)> = Vec::new();

        for (name, value) in &table {
            match name.as_str() {
                "agent" | "tags" | "global_tags" => {}
                "inputs" | "plugins" => {
                    let sub = value
                        .as_table()
                        .ok_or_else(|| ConfigError::BadTable(name.clone()))?;
                    for (plugin_name, decl) in sub {
                        let path = format!("{name}.{plugin_name}");
                        for (occurrence, block) in plugin_blocks(plugin_name, decl, true)? {
                            self.add_input(plugin_name, block, lines.line(&path, occurrence))?;
                        }
                    }
                }
                "outputs" => {
                    let sub = value
                        .as_table()
                        .ok_or_else(|| ConfigError::BadTable(name.clone()))?;
                    for (plugin_name, decl) in sub {
                        let path = format!("outputs.{plugin_name}");
                        for (occurrence, block) in plugin_blocks(plugin_name, decl, true)? {
                            self.add_output(plugin_name, block, lines.line(&path, occurrence))?;
                        }
                    }
                }
                "processors" => {
                    let sub = value
                        .as_table()
                        .ok_or_else(|| ConfigError::BadTable(name.clone()))?;
                    for (plugin_name, decl) in sub {
                        let path = format!("processors.{plugin_name}");
                        for (occurrence, block) in plugin_blocks(plugin_name, decl, false)? {
                            let line = lines.line(&path, occurrence);
                            let (before, after) = self.add_processor(plugin_name, block, line)?;
                            file_processors.push((line, before));
                            file_agg_processors.push((line, after));
                        }
                    }
                }
                "aggregators" => {
                    let sub = value
                        .as_table()
                        .ok_or_else(|| ConfigError::BadTable(name.clone()))?;
                    for (plugin_name, decl) in sub {
                        let path = format!("aggregators.{plugin_name}");
                        for (occurrence, block) in plugin_blocks(plugin_name, decl, false)? {
                            self.add_aggregator(plugin_name, block, lines.line(&path, occurrence))?;
                        }
                    }
                }
                "secretstores" => {
                    let sub = value
                        .as_table()
                        .ok_or_else(|| ConfigError::BadTable(name.clone()))?;
                    for (plugin_name, decl) in sub {
                        let path = format!("secretstores.{plugin_name}");
                        for (occurrence, block) in plugin_blocks(plugin_name, decl, false)? {
                            self.add_secret_store(plugin_name, block, lines.line(&path, occurrence))?;
                        }
                    }
                }
                // Historical config files declare inputs as bare top-level
                // tables, e.g. `[memstats]`.
                other => {
                    let block = value
                        .as_table()
                        .ok_or_else(|| ConfigError::BadTable(other.to_owned()))?;
                    self.add_input(other, block, lines.line(other, 0))?;
                }
            }
        }

        file_processors.sort_by_key(|(line, _)| *line);
        self.processors.extend(file_processors.into_iter().map(|(_, p)| p));
        file_agg_processors.sort_by_key(|(line, _)| *line);
        self.agg_processors.extend(file_agg_processors.into_iter().map(|(_, p)| p));

        Ok(())
    }

    fn add_input(&mut self, name: &str, block: &toml::Table, line: usize) -> Result<(), ConfigError> {
        if !self.input_filters.is_empty() && !self.input_filters.iter().any(|f| f == name) {
            return Ok(());
        }
        // The disk I/O input was renamed long ago; old configs still say "io".
        let name = if name == "io" { "diskio" } else { name };
        let plugin = format!("inputs.{name}");

        let factory = self
            .registry
            .input(name)
            .ok_or_else(|| ConfigError::UnknownPlugin {
                category: "input",
                name: name.to_owned(),
            })?;
        check_plugin_deprecation(&plugin, factory.deprecation.as_ref())?;

        let mut config = InputConfig {
            name: name.to_owned(),
            ..Default::default()
        };
        let ctx = FieldContext {
            plugin: &plugin,
            line,
        };
        get_field(block, "alias", &ctx, &mut config.alias)?;
        get_field(block, "interval", &ctx, &mut config.interval)?;
        get_field(block, "precision", &ctx, &mut config.precision)?;
        get_field(block, "collection_jitter", &ctx, &mut config.collection_jitter)?;
        get_field(block, "collection_offset", &ctx, &mut config.collection_offset)?;
        get_field(block, "name_override", &ctx, &mut config.name_override)?;
        get_field(block, "name_prefix", &ctx, &mut config.name_prefix)?;
        get_field(block, "name_suffix", &ctx, &mut config.name_suffix)?;
        get_field(block, "tags", &ctx, &mut config.tags)?;
        config.filter = build_filter(block, &ctx)?;
        config.id = plugin_id(&plugin, block);

        check_option_deprecations(&plugin, &factory.option_deprecations, block)?;

        let stripped = strip_reserved(block);
        let mut codec_keys: Vec<String> = Vec::new();

        let (built, collected) = secrets::collect_secrets(|| -> Result<RunningInput, ConfigError> {
            let mut instance = factory.init(stripped.clone()).map_err(|e| ConfigError::Bind {
                plugin: plugin.clone(),
                line,
                message: e.to_string(),
            })?;
            if let Some(slot) = instance.parser_slot() {
                let (parser, keys) = self.build_parser(name, block, &ctx)?;
                codec_keys = keys;
                slot.set_parser(parser);
            }
            Ok(RunningInput::new(instance, config))
        });
        let mut running = built?;
        self.unlinked_secrets.extend(collected);

        check_unused_fields(block, factory.schema().field_names(), &codec_keys, &ctx)?;

        running.set_default_tags(self.tags.clone());
        self.inputs.push(running);
        Ok(())
    }

    fn add_output(&mut self, name: &str, block: &toml::Table, line: usize) -> Result<(), ConfigError> {
        if !self.output_filters.is_empty() && !self.output_filters.iter().any(|f| f == name) {
            return Ok(());
        }
        let plugin = format!("outputs.{name}");

        let factory = self
            .registry
            .output(name)
            .ok_or_else(|| ConfigError::UnknownPlugin {
                category: "output",
                name: name.to_owned(),
            })?;
        check_plugin_deprecation(&plugin, factory.deprecation.as_ref())?;

        let mut config = OutputConfig {
            name: name.to_owned(),
            metric_batch_size: self.agent.metric_batch_size,
            metric_buffer_limit: self.agent.metric_buffer_limit,
            ..Default::default()
        };
        let ctx = FieldContext {
            plugin: &plugin,
            line,
        };
        get_field(block, "alias", &ctx, &mut config.alias)?;
        get_field(block, "flush_interval", &ctx, &mut config.flush_interval)?;
        get_field(block, "flush_jitter", &ctx, &mut config.flush_jitter)?;
        get_field(block, "metric_batch_size", &ctx, &mut config.metric_batch_size)?;
        get_field(block, "metric_buffer_limit", &ctx, &mut config.metric_buffer_limit)?;
        get_field(block, "name_override", &ctx, &mut config.name_override)?;
        get_field(block, "name_prefix", &ctx, &mut config.name_prefix)?;
        get_field(block, "name_suffix", &ctx, &mut config.name_suffix)?;
        config.filter = build_filter(block, &ctx)?;
        config.id = plugin_id(&plugin, block);

        check_option_deprecations(&plugin, &factory.option_deprecations, block)?;

        let stripped = strip_reserved(block);
        let mut codec_keys: Vec<String> = Vec::new();

        let (built, collected) = secrets::collect_secrets(|| -> Result<RunningOutput, ConfigError> {
            let mut instance = factory.init(stripped.clone()).map_err(|e| ConfigError::Bind {
                plugin: plugin.clone(),
                line,
                message: e.to_string(),
            })?;
            if let Some(slot) = instance.serializer_slot() {
                let (serializer, keys) = self.build_serializer(name, block, &ctx)?;
                codec_keys = keys;
                slot.set_serializer(serializer);
            }
            Ok(RunningOutput::new(instance, config))
        });
        let running = built?;
        self.unlinked_secrets.extend(collected);

        check_unused_fields(block, factory.schema().field_names(), &codec_keys, &ctx)?;

        self.outputs.push(running);
        Ok(())
    }

    /// Builds both instances of a processor block: the one running before
    /// aggregation and the independent aggregator-scoped copy.
    fn add_processor(
        &mut self,
        name: &str,
        block: &toml::Table,
        line: usize,
    ) -> Result<(RunningProcessor, RunningProcessor), ConfigError> {
        let factory = self
            .registry
            .processor(name)
            .ok_or_else(|| ConfigError::UnknownPlugin {
                category: "processor",
                name: name.to_owned(),
            })?;
        let plugin = format!("processors.{name}");
        check_plugin_deprecation(&plugin, factory.deprecation.as_ref())?;
        check_option_deprecations(&plugin, &factory.option_deprecations, block)?;

        let ctx = FieldContext {
            plugin: &plugin,
            line,
        };
        let stripped = strip_reserved(block);
        let mut pending: Vec<Secret> = Vec::new();

        let mut build = |category: &str, pending: &mut Vec<Secret>| -> Result<RunningProcessor, ConfigError> {
            let mut config = ProcessorConfig {
                name: name.to_owned(),
                ..Default::default()
            };
            get_field(block, "alias", &ctx, &mut config.alias)?;
            get_field(block, "order", &ctx, &mut config.order)?;
            config.filter = build_filter(block, &ctx)?;
            config.id = plugin_id(&format!("{category}.{name}"), block);

            let (instance, collected) = secrets::collect_secrets(|| {
                factory.init(stripped.clone()).map_err(|e| ConfigError::Bind {
                    plugin: plugin.clone(),
                    line,
                    message: e.to_string(),
                })
            });
            pending.extend(collected);
            Ok(RunningProcessor::new(instance?, config))
        };

        let before = build("processors", &mut pending)?;
        let after = build("aggprocessors", &mut pending)?;
        self.unlinked_secrets.extend(pending);

        check_unused_fields(block, factory.schema().field_names(), &[], &ctx)?;
        Ok((before, after))
    }

    fn add_aggregator(&mut self, name: &str, block: &toml::Table, line: usize) -> Result<(), ConfigError> {
        let factory = self
            .registry
            .aggregator(name)
            .ok_or_else(|| ConfigError::UnknownPlugin {
                category: "aggregator",
                name: name.to_owned(),
            })?;
        let plugin = format!("aggregators.{name}");
        check_plugin_deprecation(&plugin, factory.deprecation.as_ref())?;

        let mut config = AggregatorConfig {
            name: name.to_owned(),
            period: Duration::from_secs(30),
            delay: Duration::from_millis(100),
            ..Default::default()
        };
        let ctx = FieldContext {
            plugin: &plugin,
            line,
        };
        get_field(block, "alias", &ctx, &mut config.alias)?;
        get_field(block, "period", &ctx, &mut config.period)?;
        get_field(block, "delay", &ctx, &mut config.delay)?;
        get_field(block, "grace", &ctx, &mut config.grace)?;
        get_field(block, "drop_original", &ctx, &mut config.drop_original)?;
        get_field(block, "name_override", &ctx, &mut config.name_override)?;
        get_field(block, "name_prefix", &ctx, &mut config.name_prefix)?;
        get_field(block, "name_suffix", &ctx, &mut config.name_suffix)?;
        get_field(block, "tags", &ctx, &mut config.tags)?;
        config.filter = build_filter(block, &ctx)?;
        config.id = plugin_id(&plugin, block);

        check_option_deprecations(&plugin, &factory.option_deprecations, block)?;

        let stripped = strip_reserved(block);
        let (built, collected) = secrets::collect_secrets(|| {
            factory.init(stripped.clone()).map_err(|e| ConfigError::Bind {
                plugin: plugin.clone(),
                line,
                message: e.to_string(),
            })
        });
        self.unlinked_secrets.extend(collected);
        let instance = built?;

        check_unused_fields(block, factory.schema().field_names(), &[], &ctx)?;

        self.aggregators.push(RunningAggregator::new(instance, config));
        Ok(())
    }

    fn add_secret_store(&mut self, name: &str, block: &toml::Table, line: usize) -> Result<(), ConfigError> {
        if !self.secret_store_filters.is_empty() && !self.secret_store_filters.iter().any(|f| f == name) {
            return Ok(());
        }
        let plugin = format!("secretstores.{name}");
        let ctx = FieldContext {
            plugin: &plugin,
            line,
        };

        let mut store_id = String::new();
        get_field(block, "id", &ctx, &mut store_id)?;
        if store_id.is_empty() {
            return Err(ConfigError::SecretStoreWithoutId {
                name: name.to_owned(),
            });
        }
        if !store_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(ConfigError::InvalidSecretStoreId { id: store_id });
        }

        let factory = self
            .registry
            .secret_store(name)
            .ok_or_else(|| ConfigError::UnknownPlugin {
                category: "secret-store",
                name: name.to_owned(),
            })?;
        check_plugin_deprecation(&plugin, factory.deprecation.as_ref())?;
        check_option_deprecations(&plugin, &factory.option_deprecations, block)?;

        let stripped = strip_reserved(block);
        let mut instance = factory.init(stripped).map_err(|e| ConfigError::Bind {
            plugin: plugin.clone(),
            line,
            message: e.to_string(),
        })?;

        check_unused_fields(block, factory.schema().field_names(), &[], &ctx)?;

        instance.init().map_err(|source| ConfigError::SecretStoreInit {
            id: store_id.clone(),
            source,
        })?;

        if self.secret_stores.contains_key(&store_id) {
            return Err(ConfigError::DuplicateSecretStoreId {
                id: store_id,
                name: name.to_owned(),
            });
        }
        self.secret_stores.insert(store_id, instance);
        Ok(())
    }

    /// Builds the parser declared by the block's `data_format` fields.
    /// Returns it with the keys its schema consumes.
    fn build_parser(
        &self,
        parent: &str,
        block: &toml::Table,
        ctx: &FieldContext<'_>,
    ) -> Result<(RunningParser, Vec<String>), ConfigError> {
        let mut data_format = DEFAULT_DATA_FORMAT.to_owned();
        get_field(block, "data_format", ctx, &mut data_format)?;

        let factory = self
            .registry
            .parser(&data_format)
            .ok_or_else(|| ConfigError::UnknownPlugin {
                category: "parser",
                name: data_format.clone(),
            })?;
        let instance = factory.init(strip_reserved(block)).map_err(|e| ConfigError::Bind {
            plugin: ctx.plugin.to_owned(),
            line: ctx.line,
            message: format!("adding parser failed: {e}"),
        })?;
        let keys = factory.schema().field_names().map(str::to_owned).collect();
        let running = RunningParser::new(
            instance,
            ParserConfig {
                parent: parent.to_owned(),
                data_format,
            },
        );
        Ok((running, keys))
    }

    fn build_serializer(
        &self,
        parent: &str,
        block: &toml::Table,
        ctx: &FieldContext<'_>,
    ) -> Result<(RunningSerializer, Vec<String>), ConfigError> {
        let mut data_format = DEFAULT_DATA_FORMAT.to_owned();
        get_field(block, "data_format", ctx, &mut data_format)?;

        let factory = self
            .registry
            .serializer(&data_format)
            .ok_or_else(|| ConfigError::UnknownPlugin {
                category: "serializer",
                name: data_format.clone(),
            })?;
        let instance = factory.init(strip_reserved(block)).map_err(|e| ConfigError::Bind {
            plugin: ctx.plugin.to_owned(),
            line: ctx.line,
            message: format!("adding serializer failed: {e}"),
        })?;
        let keys = factory.schema().field_names().map(str::to_owned).collect();
        let running = RunningSerializer::new(
            instance,
            SerializerConfig {
                parent: parent.to_owned(),
                data_format,
            },
        );
        Ok((running, keys))
    }
}

/// Names and line number of the block being bound, for error messages.
struct FieldContext<'a> {
    plugin: &'a str,
    line: usize,
}

/// Reads one typed field out of a block, leaving `target` untouched when the
/// key is absent.
fn get_field<T: DeserializeOwned>(
    table: &toml::Table,
    key: &str,
    ctx: &FieldContext<'_>,
    target: &mut T,
) -> Result<(), ConfigError> {
    let Some(value) = table.get(key) else {
        return Ok(());
    };
    *target = value
        .clone()
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::Field {
            plugin: ctx.plugin.to_owned(),
            line: ctx.line,
            key: key.to_owned(),
            message: e.to_string(),
        })?;
    Ok(())
}

/// Builds and compiles the filter declared on a block. Both historic
/// spellings of the field filters (`pass`/`drop`) are accepted.
fn build_filter(block: &toml::Table, ctx: &FieldContext<'_>) -> Result<Filter, ConfigError> {
    let mut filter = Filter::default();
    get_field(block, "namepass", ctx, &mut filter.name_pass)?;
    get_field(block, "namedrop", ctx, &mut filter.name_drop)?;

    let mut legacy_pass: Vec<String> = Vec::new();
    get_field(block, "pass", ctx, &mut legacy_pass)?;
    filter.field_pass = legacy_pass;
    get_field(block, "fieldpass", ctx, &mut filter.field_pass)?;

    let mut legacy_drop: Vec<String> = Vec::new();
    get_field(block, "drop", ctx, &mut legacy_drop)?;
    filter.field_drop = legacy_drop;
    get_field(block, "fielddrop", ctx, &mut filter.field_drop)?;

    filter.tag_pass = get_tag_filters(block, "tagpass", ctx)?;
    filter.tag_drop = get_tag_filters(block, "tagdrop", ctx)?;
    get_field(block, "tagexclude", ctx, &mut filter.tag_exclude)?;
    get_field(block, "taginclude", ctx, &mut filter.tag_include)?;

    filter.compile().map_err(|source| ConfigError::Filter {
        plugin: ctx.plugin.to_owned(),
        source,
    })?;
    Ok(filter)
}

fn get_tag_filters(
    block: &toml::Table,
    key: &str,
    ctx: &FieldContext<'_>,
) -> Result<Vec<TagFilter>, ConfigError> {
    let Some(value) = block.get(key) else {
        return Ok(Vec::new());
    };
    let sub = value.as_table().ok_or_else(|| ConfigError::Field {
        plugin: ctx.plugin.to_owned(),
        line: ctx.line,
        key: key.to_owned(),
        message: "expected a table of tag-name to glob-list entries".to_owned(),
    })?;
    let mut filters = Vec::with_capacity(sub.len());
    for (tag, globs) in sub {
        let values: Vec<String> = globs.clone().try_into().map_err(|_| ConfigError::Field {
            plugin: ctx.plugin.to_owned(),
            line: ctx.line,
            key: format!("{key}.{tag}"),
            message: "expected an array of glob strings".to_owned(),
        })?;
        filters.push(TagFilter {
            name: tag.clone(),
            values,
        });
    }
    Ok(filters)
}

/// The block without the keys the binder consumes itself.
fn strip_reserved(block: &toml::Table) -> toml::Table {
    block
        .iter()
        .filter(|(key, _)| !RESERVED_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Fails when the block declares keys that neither the binder, the plugin
/// schema nor the attached codec recognizes.
fn check_unused_fields<'a>(
    block: &toml::Table,
    plugin_keys: impl Iterator<Item = &'a str>,
    codec_keys: &[String],
    ctx: &FieldContext<'_>,
) -> Result<(), ConfigError> {
    let recognized: IndexSet<&str> = plugin_keys.collect();
    let unused: Vec<String> = block
        .keys()
        .filter(|key| {
            !RESERVED_KEYS.contains(&key.as_str())
                && !recognized.contains(key.as_str())
                && !codec_keys.iter().any(|k| k == key.as_str())
        })
        .cloned()
        .collect();
    if unused.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::UnusedFields {
            plugin: ctx.plugin.to_owned(),
            line: ctx.line,
            fields: unused,
        })
    }
}

fn check_plugin_deprecation(
    plugin: &str,
    info: Option<&deprecation::DeprecationInfo>,
) -> Result<(), ConfigError> {
    let Some(info) = info else {
        return Ok(());
    };
    match info.level() {
        DeprecationLevel::None => Ok(()),
        DeprecationLevel::Warn => {
            let (category, name) = plugin.split_once('.').unwrap_or(("", plugin));
            deprecation::warn_plugin(category, name, info);
            Ok(())
        }
        DeprecationLevel::Error => Err(ConfigError::RemovedPlugin {
            plugin: plugin.to_owned(),
            since: info.since.to_owned(),
            removal: info.removal_text(),
            notice: info.notice.to_owned(),
        }),
    }
}

fn check_option_deprecations(
    plugin: &str,
    options: &[deprecation::OptionDeprecation],
    block: &toml::Table,
) -> Result<(), ConfigError> {
    for od in options {
        if !block.contains_key(od.option) {
            continue;
        }
        match od.info.level() {
            DeprecationLevel::None => {}
            DeprecationLevel::Warn => {
                let (category, name) = plugin.split_once('.').unwrap_or(("", plugin));
                deprecation::warn_option(category, name, od.option, &od.info);
            }
            DeprecationLevel::Error => {
                return Err(ConfigError::RemovedOption {
                    plugin: plugin.to_owned(),
                    option: od.option.to_owned(),
                    since: od.info.since.to_owned(),
                    removal: od.info.removal_text(),
                    notice: od.info.notice.to_owned(),
                })
            }
        }
    }
    Ok(())
}

/// Yields the concrete blocks of one declared plugin: either the modern
/// array-of-tables form or (for inputs and outputs) the legacy single-table
/// form.
fn plugin_blocks<'v>(
    plugin_name: &str,
    decl: &'v toml::Value,
    allow_single: bool,
) -> Result<Vec<(usize, &'v toml::Table)>, ConfigError> {
    match decl {
        toml::Value::Table(t) if allow_single => Ok(vec![(0, t)]),
        toml::Value::Array(items) => {
            let mut blocks = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                let t = item
                    .as_table()
                    .ok_or_else(|| ConfigError::UnsupportedFormat(plugin_name.to_owned()))?;
                blocks.push((i, t));
            }
            Ok(blocks)
        }
        _ => Err(ConfigError::UnsupportedFormat(plugin_name.to_owned())),
    }
}

/// Stable-sorts processors by their declared order. Processors without an
/// explicit order get a strongly negative key biased by file position, so
/// they run first and keep their declaration order.
fn sort_processors(processors: &mut Vec<RunningProcessor>) {
    let mut keyed: Vec<(i64, RunningProcessor)> = processors
        .drain(..)
        .enumerate()
        .map(|(position, p)| {
            let key = p.config.order.unwrap_or(i64::MIN + position as i64);
            (key, p)
        })
        .collect();
    keyed.sort_by_key(|(key, _)| *key);
    *processors = keyed.into_iter().map(|(_, p)| p).collect();
}

/// Merges `overrider` into `original`, table by table (deep merge).
pub fn merge_override(original: &mut toml::Table, overrider: toml::Table) {
    for (key, value) in overrider {
        match original.get_mut(&key) {
            Some(toml::Value::Table(existing)) => {
                if let toml::Value::Table(tbl) = value {
                    merge_override(existing, tbl);
                } else {
                    original.insert(key, value);
                }
            }
            _ => {
                original.insert(key, value);
            }
        }
    }
}

/// Maps `[header]` paths to the source lines they appear on, so binding
/// errors can point at the offending block. Array-of-table headers record
/// one line per occurrence.
struct LineIndex {
    headers: BTreeMap<String, Vec<usize>>,
}

impl LineIndex {
    fn build(text: &str) -> Self {
        let mut headers: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (number, line) in text.lines().enumerate() {
            let trimmed = line.trim_start();
            let Some(header) = parse_header(trimmed) else {
                continue;
            };
            headers.entry(header).or_default().push(number + 1);
        }
        LineIndex { headers }
    }

    /// The line of the `occurrence`-th block with this header path, or 0
    /// when unknown (e.g. dotted keys instead of a header).
    fn line(&self, path: &str, occurrence: usize) -> usize {
        let Some(lines) = self.headers.get(path) else {
            return 0;
        };
        lines
            .get(occurrence)
            .or_else(|| lines.first())
            .copied()
            .unwrap_or(0)
    }
}

fn parse_header(line: &str) -> Option<String> {
    let inner = line
        .strip_prefix("[[")
        .and_then(|rest| rest.split(']').next())
        .or_else(|| line.strip_prefix('[').and_then(|rest| rest.split(']').next()))?;
    let path: Vec<String> = inner
        .split('.')
        .map(|part| part.trim().trim_matches(['"', '\'']).to_owned())
        .collect();
    Some(path.join("."))
}

#[cfg(unix)]
fn os_hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr().cast::<libc::c_char>(), buf.len()) };
    if ret != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8(buf[..end].to_vec()).ok()
}

#[cfg(not(unix))]
fn os_hostname() -> Option<String> {
    std::env::var("COMPUTERNAME").ok()
}
