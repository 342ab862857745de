//! Output plugin appending metrics to a CSV file.
//!
//! One row per field: timestamp, metric name, tag pairs, field key, value.

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use vantage::metric::Metric;
use vantage::plugin::{Output, StaticPlugin};

#[derive(Deserialize, Serialize)]
#[serde(default)]
pub struct CsvOutput {
    /// File the rows are appended to.
    pub path: String,
    pub delimiter: String,
    /// Write a header row when the file is created.
    pub header: bool,

    #[serde(skip)]
    file: Option<File>,
}

impl Default for CsvOutput {
    fn default() -> Self {
        CsvOutput {
            path: "vantage-metrics.csv".to_owned(),
            delimiter: ",".to_owned(),
            header: true,
            file: None,
        }
    }
}

impl CsvOutput {
    fn render(&self, metric: &Metric) -> String {
        let sep = &self.delimiter;
        let timestamp = metric
            .timestamp
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let tags = metric
            .tags
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");

        let mut rows = String::new();
        for (key, value) in &metric.fields {
            rows.push_str(&format!(
                "{timestamp}{sep}{}{sep}{tags}{sep}{key}{sep}{value}\n",
                metric.name
            ));
        }
        rows
    }
}

impl Output for CsvOutput {
    fn connect(&mut self) -> anyhow::Result<()> {
        let exists = std::path::Path::new(&self.path).exists();
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        if self.header && !exists {
            let sep = &self.delimiter;
            writeln!(file, "timestamp{sep}name{sep}tags{sep}field{sep}value")?;
        }
        self.file = Some(file);
        Ok(())
    }

    fn write(&mut self, metrics: &[Metric]) -> anyhow::Result<()> {
        let rows: String = metrics.iter().map(|m| self.render(m)).collect();
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("csv output used before connect"))?;
        log::trace!("appending {} metrics to {}", metrics.len(), self.path);
        file.write_all(rows.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.file = None;
        Ok(())
    }
}

impl StaticPlugin for CsvOutput {
    fn name() -> &'static str {
        "csv"
    }

    fn sample_config() -> &'static str {
        "  ## File the rows are appended to.\n  path = \"vantage-metrics.csv\"\n  # delimiter = \",\"\n  # header = true\n"
    }

    fn description() -> &'static str {
        "Append metrics to a CSV file"
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn writes_one_row_per_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let mut output = CsvOutput {
            path: path.to_string_lossy().into_owned(),
            header: false,
            ..Default::default()
        };
        output.connect().unwrap();

        let metric = Metric::new("cpu")
            .with_tag("host", "web01")
            .with_field("usage_user", 0.5)
            .with_field("usage_system", 0.25);
        output.write(std::slice::from_ref(&metric)).unwrap();
        output.close().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("cpu,host=web01,usage_system,0.25"));
        assert!(lines[1].contains("cpu,host=web01,usage_user,0.5"));
    }

    #[test]
    fn header_is_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let mut output = CsvOutput {
            path: path.to_string_lossy().into_owned(),
            ..Default::default()
        };
        output.connect().unwrap();
        output.close().unwrap();

        let mut output2 = CsvOutput {
            path: path.to_string_lossy().into_owned(),
            ..Default::default()
        };
        output2.connect().unwrap();
        output2.close().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().filter(|l| l.starts_with("timestamp")).count(), 1);
    }

    #[test]
    fn write_before_connect_fails() {
        let mut output = CsvOutput::default();
        assert!(output.write(&[]).is_err());
    }
}
