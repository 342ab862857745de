//! Input plugin reading the Linux load averages from procfs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use vantage::metric::{Accumulator, FieldValue};
use vantage::plugin::{Input, StaticPlugin};

#[derive(Deserialize, Serialize)]
#[serde(default)]
pub struct SysloadInput {
    /// Path of the loadavg file, overridable for testing.
    pub path: String,
}

impl Default for SysloadInput {
    fn default() -> Self {
        SysloadInput {
            path: "/proc/loadavg".to_owned(),
        }
    }
}

impl Input for SysloadInput {
    fn gather(&mut self, acc: &mut dyn Accumulator) -> anyhow::Result<()> {
        log::trace!("reading load averages from {}", self.path);
        let content = std::fs::read_to_string(&self.path)?;
        let mut parts = content.split_whitespace();
        let mut fields = BTreeMap::new();
        for key in ["load1", "load5", "load15"] {
            let value: f64 = parts
                .next()
                .ok_or_else(|| anyhow::anyhow!("short read from {}", self.path))?
                .parse()?;
            fields.insert(key.to_owned(), FieldValue::Float(value));
        }
        acc.add_fields("system_load", fields, BTreeMap::new());
        Ok(())
    }
}

impl StaticPlugin for SysloadInput {
    fn name() -> &'static str {
        "sysload"
    }

    fn sample_config() -> &'static str {
        "  ## Path of the loadavg file.\n  # path = \"/proc/loadavg\"\n"
    }

    fn description() -> &'static str {
        "Read the system load averages"
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use vantage::metric::Metric;

    use super::*;

    #[derive(Default)]
    struct Collected(Vec<Metric>);

    impl Accumulator for Collected {
        fn add_metric(&mut self, metric: Metric) {
            self.0.push(metric);
        }

        fn add_error(&mut self, error: anyhow::Error) {
            panic!("unexpected error: {error}");
        }
    }

    #[test]
    fn gathers_three_load_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loadavg");
        std::fs::write(&path, "0.52 0.41 0.30 1/213 4591\n").unwrap();

        let mut input = SysloadInput {
            path: path.to_string_lossy().into_owned(),
        };
        let mut acc = Collected::default();
        input.gather(&mut acc).unwrap();

        assert_eq!(acc.0.len(), 1);
        let metric = &acc.0[0];
        assert_eq!(metric.name, "system_load");
        assert_eq!(metric.fields["load1"], FieldValue::Float(0.52));
        assert_eq!(metric.fields["load5"], FieldValue::Float(0.41));
        assert_eq!(metric.fields["load15"], FieldValue::Float(0.30));
    }

    #[test]
    fn short_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loadavg");
        std::fs::write(&path, "0.52\n").unwrap();

        let mut input = SysloadInput {
            path: path.to_string_lossy().into_owned(),
        };
        let mut acc = Collected::default();
        assert!(input.gather(&mut acc).is_err());
    }
}
