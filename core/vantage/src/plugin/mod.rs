//! Plugin capability surfaces and registration.
//!
//! Plugins come in four categories (inputs, outputs, processors,
//! aggregators) plus secret stores and the parser/serializer codecs that
//! extensible inputs and outputs consume. A plugin struct carries its
//! configuration fields directly (runtime state goes in `#[serde(skip)]`
//! fields); the binder deserializes the declared block straight into it.
//!
//! Registration is static: implement the capability trait plus
//! [`StaticPlugin`], and add the type to a [`PluginRegistry`](registry::PluginRegistry)
//! with the matching `register_*` call.

pub mod registry;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::deprecation::{DeprecationInfo, OptionDeprecation};
use crate::config::schema::FieldHint;
use crate::metric::{Accumulator, Metric};
use crate::models::{RunningParser, RunningSerializer};

/// A metric-collecting plugin.
pub trait Input: Send {
    /// Collects the current values and hands them to the accumulator.
    fn gather(&mut self, acc: &mut dyn Accumulator) -> anyhow::Result<()>;

    /// Inputs that ingest raw payloads expose their parser slot here so the
    /// binder can construct and attach the configured data-format parser.
    fn parser_slot(&mut self) -> Option<&mut dyn ParserConsumer> {
        None
    }
}

/// A metric-publishing plugin.
pub trait Output: Send {
    /// Opens the connection to the backing service.
    fn connect(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Writes a batch of metrics.
    fn write(&mut self, metrics: &[Metric]) -> anyhow::Result<()>;

    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Outputs that emit raw payloads expose their serializer slot here.
    fn serializer_slot(&mut self) -> Option<&mut dyn SerializerConsumer> {
        None
    }
}

/// A metric-transforming plugin.
pub trait Processor: Send {
    /// Transforms one metric into zero or more metrics.
    fn apply(&mut self, metric: Metric) -> Vec<Metric>;
}

/// A metric-aggregating plugin.
pub trait Aggregator: Send {
    /// Feeds one metric into the aggregation window.
    fn add(&mut self, metric: &Metric);

    /// Emits the aggregates for the current window.
    fn push(&mut self, acc: &mut dyn Accumulator);

    /// Clears the window.
    fn reset(&mut self);
}

/// A data-format decoder built from the `data_format` fields of a block.
pub trait Parser: Send {
    fn parse(&mut self, data: &[u8]) -> anyhow::Result<Vec<Metric>>;
}

/// A data-format encoder built from the `data_format` fields of a block.
pub trait Serializer: Send {
    fn serialize(&mut self, metric: &Metric) -> anyhow::Result<Vec<u8>>;
}

/// Implemented by inputs (and processors) that accept an arbitrary parser.
pub trait ParserConsumer {
    fn set_parser(&mut self, parser: RunningParser);
}

/// Implemented by outputs that accept an arbitrary serializer.
pub trait SerializerConsumer {
    fn set_serializer(&mut self, serializer: RunningSerializer);
}

/// Static registration data for a plugin type.
///
/// `Deserialize` binds the declared block onto the instance, `Serialize` +
/// `Default` drive schema reflection and default-config generation.
pub trait StaticPlugin: DeserializeOwned + Serialize + Default {
    /// The name used in configuration blocks, e.g. `"memcached"`.
    fn name() -> &'static str;

    /// A commented example configuration block.
    fn sample_config() -> &'static str;

    /// A one-line description of what the plugin does.
    fn description() -> &'static str;

    /// Deprecation state of the whole plugin, if any.
    fn deprecation() -> Option<DeprecationInfo> {
        None
    }

    /// Deprecation state of individual options.
    fn option_deprecations() -> &'static [OptionDeprecation] {
        &[]
    }

    /// `format`/`required` annotations for schema reflection.
    fn field_hints() -> &'static [FieldHint] {
        &[]
    }
}
