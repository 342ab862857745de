//! The built-in `plain` data format: one metric per line.
//!
//! Parsing reads `name field=value ...` lines; serializing writes the same
//! shape. This is the default codec for extensible inputs and outputs that
//! do not declare a `data_format`.

use serde::{Deserialize, Serialize};
use vantage::metric::{FieldValue, Metric};
use vantage::plugin::{Parser, Serializer, StaticPlugin};

#[derive(Deserialize, Serialize, Default)]
#[serde(default)]
pub struct PlainParser {
    /// Parse numeric field values as floats instead of keeping them as
    /// strings.
    pub numeric_fields: bool,
}

impl Parser for PlainParser {
    fn parse(&mut self, data: &[u8]) -> anyhow::Result<Vec<Metric>> {
        let text = std::str::from_utf8(data)?;
        let mut metrics = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let name = parts
                .next()
                .ok_or_else(|| anyhow::anyhow!("empty metric line"))?;
            let mut metric = Metric::new(name);
            for part in parts {
                let (key, value) = part
                    .split_once('=')
                    .ok_or_else(|| anyhow::anyhow!("malformed field {part:?} in line {line:?}"))?;
                let value = if self.numeric_fields {
                    FieldValue::Float(value.parse()?)
                } else {
                    match value.parse::<f64>() {
                        Ok(v) => FieldValue::Float(v),
                        Err(_) => FieldValue::String(value.to_owned()),
                    }
                };
                metric.fields.insert(key.to_owned(), value);
            }
            metrics.push(metric);
        }
        Ok(metrics)
    }
}

impl StaticPlugin for PlainParser {
    fn name() -> &'static str {
        "plain"
    }

    fn sample_config() -> &'static str {
        "  ## Treat unparsable numeric fields as errors instead of strings.\n  # numeric_fields = false\n"
    }

    fn description() -> &'static str {
        "Parse one metric per line as name followed by field=value pairs"
    }
}

#[derive(Deserialize, Serialize, Default)]
#[serde(default)]
pub struct PlainSerializer {}

impl Serializer for PlainSerializer {
    fn serialize(&mut self, metric: &Metric) -> anyhow::Result<Vec<u8>> {
        let mut line = metric.name.clone();
        for (key, value) in &metric.fields {
            line.push(' ');
            line.push_str(key);
            line.push('=');
            line.push_str(&value.to_string());
        }
        line.push('\n');
        Ok(line.into_bytes())
    }
}

impl StaticPlugin for PlainSerializer {
    fn name() -> &'static str {
        "plain"
    }

    fn sample_config() -> &'static str {
        ""
    }

    fn description() -> &'static str {
        "Write one metric per line as name followed by field=value pairs"
    }
}
