//! Named plugin factories, one registry per agent process.
//!
//! The binder looks plugins up by category and name, builds the instance
//! from the declared table and consults the reflected schema for
//! unused-field detection. The registry is assembled by the agent binary at
//! startup from the statically linked plugin crates.

use std::collections::BTreeMap;

use crate::config::deprecation::{DeprecationInfo, OptionDeprecation};
use crate::config::schema::PluginSchema;
use crate::plugin::{Aggregator, Input, Output, Parser, Processor, Serializer, StaticPlugin};
use crate::secrets::SecretStore;

type InitFn<T> = Box<dyn Fn(toml::Table) -> anyhow::Result<Box<T>> + Send + Sync>;

/// One registered plugin type of category `T`.
pub struct Factory<T: ?Sized> {
    pub name: String,
    pub description: String,
    pub sample_config: String,
    pub deprecation: Option<DeprecationInfo>,
    pub option_deprecations: Vec<OptionDeprecation>,
    schema: PluginSchema,
    init: InitFn<T>,
    default_config: fn() -> anyhow::Result<toml::Table>,
}

impl<T: ?Sized> Factory<T> {
    /// Instantiates the plugin from its declared (already stripped) table.
    pub fn init(&self, table: toml::Table) -> anyhow::Result<Box<T>> {
        (self.init)(table)
    }

    /// The reflected configuration schema of the plugin type.
    pub fn schema(&self) -> &PluginSchema {
        &self.schema
    }

    /// The serialized default configuration of the plugin type.
    pub fn default_config(&self) -> anyhow::Result<toml::Table> {
        (self.default_config)()
    }
}

fn make_factory<P, T>(wrap: fn(P) -> Box<T>) -> Factory<T>
where
    P: StaticPlugin + 'static,
    T: ?Sized,
{
    // A schema failure is a bug in the plugin definition; fail at
    // registration time, not in the middle of a config load.
    let schema = PluginSchema::describe_with_hints(P::name(), &P::default(), P::field_hints())
        .unwrap_or_else(|e| panic!("plugin {:?} has an invalid configuration schema: {e}", P::name()));
    Factory {
        name: P::name().to_owned(),
        description: P::description().to_owned(),
        sample_config: P::sample_config().to_owned(),
        deprecation: P::deprecation(),
        option_deprecations: P::option_deprecations().to_vec(),
        schema,
        init: Box::new(move |table| {
            let plugin: P = toml::Value::Table(table).try_into()?;
            Ok(wrap(plugin))
        }),
        default_config: || {
            let table = toml::Table::try_from(P::default())?;
            Ok(table)
        },
    }
}

pub type InputFactory = Factory<dyn Input>;
pub type OutputFactory = Factory<dyn Output>;
pub type ProcessorFactory = Factory<dyn Processor>;
pub type AggregatorFactory = Factory<dyn Aggregator>;
pub type SecretStoreFactory = Factory<dyn SecretStore>;
pub type ParserFactory = Factory<dyn Parser>;
pub type SerializerFactory = Factory<dyn Serializer>;

/// All plugin types known to this agent process, keyed by category and name.
#[derive(Default)]
pub struct PluginRegistry {
    inputs: BTreeMap<String, InputFactory>,
    outputs: BTreeMap<String, OutputFactory>,
    processors: BTreeMap<String, ProcessorFactory>,
    aggregators: BTreeMap<String, AggregatorFactory>,
    secret_stores: BTreeMap<String, SecretStoreFactory>,
    parsers: BTreeMap<String, ParserFactory>,
    serializers: BTreeMap<String, SerializerFactory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_input<P: StaticPlugin + Input + 'static>(&mut self) {
        self.inputs
            .insert(P::name().to_owned(), make_factory::<P, dyn Input>(|p| Box::new(p)));
    }

    pub fn register_output<P: StaticPlugin + Output + 'static>(&mut self) {
        self.outputs
            .insert(P::name().to_owned(), make_factory::<P, dyn Output>(|p| Box::new(p)));
    }

    pub fn register_processor<P: StaticPlugin + Processor + 'static>(&mut self) {
        self.processors
            .insert(P::name().to_owned(), make_factory::<P, dyn Processor>(|p| Box::new(p)));
    }

    pub fn register_aggregator<P: StaticPlugin + Aggregator + 'static>(&mut self) {
        self.aggregators
            .insert(P::name().to_owned(), make_factory::<P, dyn Aggregator>(|p| Box::new(p)));
    }

    pub fn register_secret_store<P: StaticPlugin + SecretStore + 'static>(&mut self) {
        self.secret_stores
            .insert(P::name().to_owned(), make_factory::<P, dyn SecretStore>(|p| Box::new(p)));
    }

    pub fn register_parser<P: StaticPlugin + Parser + 'static>(&mut self) {
        self.parsers
            .insert(P::name().to_owned(), make_factory::<P, dyn Parser>(|p| Box::new(p)));
    }

    pub fn register_serializer<P: StaticPlugin + Serializer + 'static>(&mut self) {
        self.serializers
            .insert(P::name().to_owned(), make_factory::<P, dyn Serializer>(|p| Box::new(p)));
    }

    pub fn input(&self, name: &str) -> Option<&InputFactory> {
        self.inputs.get(name)
    }

    pub fn output(&self, name: &str) -> Option<&OutputFactory> {
        self.outputs.get(name)
    }

    pub fn processor(&self, name: &str) -> Option<&ProcessorFactory> {
        self.processors.get(name)
    }

    pub fn aggregator(&self, name: &str) -> Option<&AggregatorFactory> {
        self.aggregators.get(name)
    }

    pub fn secret_store(&self, name: &str) -> Option<&SecretStoreFactory> {
        self.secret_stores.get(name)
    }

    pub fn parser(&self, name: &str) -> Option<&ParserFactory> {
        self.parsers.get(name)
    }

    pub fn serializer(&self, name: &str) -> Option<&SerializerFactory> {
        self.serializers.get(name)
    }

    pub fn iter_inputs(&self) -> impl Iterator<Item = &InputFactory> {
        self.inputs.values()
    }

    pub fn iter_outputs(&self) -> impl Iterator<Item = &OutputFactory> {
        self.outputs.values()
    }

    pub fn iter_processors(&self) -> impl Iterator<Item = &ProcessorFactory> {
        self.processors.values()
    }

    pub fn iter_aggregators(&self) -> impl Iterator<Item = &AggregatorFactory> {
        self.aggregators.values()
    }

    pub fn iter_secret_stores(&self) -> impl Iterator<Item = &SecretStoreFactory> {
        self.secret_stores.values()
    }
}

/// Registers several plugin types in one go.
///
/// ```ignore
/// let mut registry = PluginRegistry::new();
/// register_plugins![registry:
///     input MemStats,
///     output CsvWriter,
/// ];
/// ```
#[macro_export]
macro_rules! register_plugins {
    [$registry:ident: $( $category:ident $plugin:path ),+ $(,)?] => {
        {
            $( $crate::register_plugins!(@one $registry, $category, $plugin); )+
        }
    };
    (@one $registry:expr, input, $plugin:path) => {
        $registry.register_input::<$plugin>()
    };
    (@one $registry:expr, output, $plugin:path) => {
        $registry.register_output::<$plugin>()
    };
    (@one $registry:expr, processor, $plugin:path) => {
        $registry.register_processor::<$plugin>()
    };
    (@one $registry:expr, aggregator, $plugin:path) => {
        $registry.register_aggregator::<$plugin>()
    };
    (@one $registry:expr, secret_store, $plugin:path) => {
        $registry.register_secret_store::<$plugin>()
    };
    (@one $registry:expr, parser, $plugin:path) => {
        $registry.register_parser::<$plugin>()
    };
    (@one $registry:expr, serializer, $plugin:path) => {
        $registry.register_serializer::<$plugin>()
    };
}
