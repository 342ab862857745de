//! The vantage agent binary.
//!
//! Assembles the plugin registry from the statically linked plugin crates,
//! loads and validates the configuration, links secrets, and reports the
//! resulting plugin set. `--test` runs one collection pass and prints the
//! gathered metrics; `--sample-config` prints a generated default
//! configuration built from every registered plugin's defaults.

mod plain;
mod stores;

use clap::Parser;
use vantage::config::{AgentConfig, Config};
use vantage::metric::{Accumulator, Metric};
use vantage::plugin::registry::PluginRegistry;
use vantage::{list_tags, plugin_name_counts, register_plugins};

#[derive(Parser)]
#[command(name = "vantage-agent", version = vantage::version(), about = "Pluggable telemetry agent")]
struct Cli {
    /// Configuration file or URL to load. May be given multiple times.
    #[arg(long = "config")]
    config: Vec<String>,

    /// Directory to recursively scan for additional *.conf files.
    #[arg(long = "config-directory")]
    config_directory: Vec<String>,

    /// Only activate the listed input plugins (colon-separated names).
    #[arg(long = "input-filter")]
    input_filter: Option<String>,

    /// Only activate the listed output plugins (colon-separated names).
    #[arg(long = "output-filter")]
    output_filter: Option<String>,

    /// Only activate the listed secret stores (colon-separated names).
    #[arg(long = "secretstore-filter")]
    secretstore_filter: Option<String>,

    /// Load the configuration, run one collection pass, print the metrics
    /// and exit.
    #[arg(long)]
    test: bool,

    /// Print a generated default configuration and exit.
    #[arg(long = "sample-config")]
    sample_config: bool,

    /// Print the description and example block of one plugin
    /// (e.g. "inputs.sysload") and exit.
    #[arg(long)]
    usage: Option<String>,
}

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

/// Registers every plugin shipped with this binary.
fn load_registry() -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    register_plugins![registry:
        output plugin_csv::CsvOutput,
        parser plain::PlainParser,
        serializer plain::PlainSerializer,
        secret_store stores::EnvStore,
    ];
    #[cfg(target_os = "linux")]
    register_plugins![registry:
        input plugin_sysload::SysloadInput,
    ];
    registry
}

fn split_filter(list: &str) -> Vec<String> {
    list.split(':')
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

fn main() -> anyhow::Result<()> {
    init_logger();
    let cli = Cli::parse();
    let registry = load_registry();

    if cli.sample_config {
        print!("{}", sample_config(&registry)?);
        return Ok(());
    }
    if let Some(plugin) = &cli.usage {
        print!("{}", usage(&registry, plugin)?);
        return Ok(());
    }

    let mut config = Config::new(registry);
    if let Some(filter) = &cli.input_filter {
        config.input_filters = split_filter(filter);
    }
    if let Some(filter) = &cli.output_filter {
        config.output_filters = split_filter(filter);
    }
    if let Some(filter) = &cli.secretstore_filter {
        config.secret_store_filters = split_filter(filter);
    }

    let mut sources = cli.config.clone();
    sources.extend(cli.config_directory.iter().cloned());
    config.load_all(&sources)?;

    report(&config);

    if cli.test {
        run_test(&mut config)?;
    }
    Ok(())
}

fn report(config: &Config) {
    let inputs: Vec<&str> = config.inputs.iter().map(|i| i.config.name.as_str()).collect();
    let outputs: Vec<&str> = config.outputs.iter().map(|o| o.config.name.as_str()).collect();
    let processors: Vec<&str> = config.processors.iter().map(|p| p.config.name.as_str()).collect();
    let aggregators: Vec<&str> = config.aggregators.iter().map(|a| a.config.name.as_str()).collect();

    log::info!("loaded inputs: {}", plugin_name_counts(inputs).join(" "));
    log::info!("loaded outputs: {}", plugin_name_counts(outputs).join(" "));
    if !processors.is_empty() {
        log::info!("loaded processors: {}", plugin_name_counts(processors).join(" "));
    }
    if !aggregators.is_empty() {
        log::info!("loaded aggregators: {}", plugin_name_counts(aggregators).join(" "));
    }
    log::info!("global tags: {}", list_tags(&config.tags));
}

/// Accumulator used by `--test`: keeps everything in memory.
#[derive(Default)]
struct TestAccumulator {
    metrics: Vec<Metric>,
}

impl Accumulator for TestAccumulator {
    fn add_metric(&mut self, metric: Metric) {
        self.metrics.push(metric);
    }

    fn add_error(&mut self, error: anyhow::Error) {
        log::error!("collection error: {error}");
    }
}

/// One synchronous pass: gather every input, run the processor pipeline and
/// print the resulting metrics.
fn run_test(config: &mut Config) -> anyhow::Result<()> {
    let mut acc = TestAccumulator::default();
    for input in &mut config.inputs {
        let mut gathered = TestAccumulator::default();
        if let Err(e) = input.input.gather(&mut gathered) {
            log::error!("{}: gather failed: {e}", input.log_name());
            continue;
        }
        for metric in gathered.metrics {
            if let Some(metric) = input.make_metric(metric) {
                acc.add_metric(metric);
            }
        }
    }

    let mut metrics = acc.metrics;
    for processor in &mut config.processors {
        let drained = std::mem::take(&mut metrics);
        metrics = drained
            .into_iter()
            .flat_map(|m| processor.processor.apply(m))
            .collect();
    }

    for metric in &metrics {
        println!("{}", format_metric(metric));
    }
    Ok(())
}

fn format_metric(metric: &Metric) -> String {
    let mut line = metric.name.clone();
    for (key, value) in &metric.tags {
        line.push_str(&format!(",{key}={value}"));
    }
    for (i, (key, value)) in metric.fields.iter().enumerate() {
        line.push(if i == 0 { ' ' } else { ',' });
        line.push_str(&format!("{key}={value}"));
    }
    line
}

/// Renders the description and sample configuration of one plugin.
fn usage(registry: &PluginRegistry, plugin: &str) -> anyhow::Result<String> {
    let (category, name) = plugin
        .split_once('.')
        .ok_or_else(|| anyhow::anyhow!("expected a category.name plugin reference, got {plugin:?}"))?;
    let (description, sample) = match category {
        "inputs" => registry.input(name).map(|f| (&f.description, &f.sample_config)),
        "outputs" => registry.output(name).map(|f| (&f.description, &f.sample_config)),
        "processors" => registry.processor(name).map(|f| (&f.description, &f.sample_config)),
        "aggregators" => registry.aggregator(name).map(|f| (&f.description, &f.sample_config)),
        "secretstores" => registry
            .secret_store(name)
            .map(|f| (&f.description, &f.sample_config)),
        other => anyhow::bail!("unknown plugin category {other:?}"),
    }
    .ok_or_else(|| anyhow::anyhow!("no {category} plugin named {name:?} in this build"))?;
    Ok(format!("# {description}\n[[{category}.{name}]]\n{sample}"))
}

/// Builds a default configuration document from the agent defaults and
/// every registered plugin's default options.
fn sample_config(registry: &PluginRegistry) -> anyhow::Result<String> {
    let mut root = toml::Table::new();
    root.insert(
        "agent".to_owned(),
        toml::Value::Table(toml::Table::try_from(AgentConfig::default())?),
    );

    let mut inputs = toml::Table::new();
    for factory in registry.iter_inputs() {
        inputs.insert(
            factory.name.clone(),
            toml::Value::Array(vec![toml::Value::Table(factory.default_config()?)]),
        );
    }
    if !inputs.is_empty() {
        root.insert("inputs".to_owned(), toml::Value::Table(inputs));
    }

    let mut outputs = toml::Table::new();
    for factory in registry.iter_outputs() {
        outputs.insert(
            factory.name.clone(),
            toml::Value::Array(vec![toml::Value::Table(factory.default_config()?)]),
        );
    }
    if !outputs.is_empty() {
        root.insert("outputs".to_owned(), toml::Value::Table(outputs));
    }

    let rendered = toml::to_string_pretty(&toml::Value::Table(root))?;
    Ok(format!("# Vantage agent configuration, generated defaults.\n\n{rendered}"))
}
