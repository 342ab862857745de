//! Built-in secret stores.

use serde::{Deserialize, Serialize};
use vantage::plugin::StaticPlugin;
use vantage::secrets::{ResolveFn, SecretStore};

/// Secret store backed by environment variables.
///
/// A reference `@{env_store_id:key}` resolves to the value of the
/// environment variable `<prefix><KEY>`, with the key upper-cased.
#[derive(Deserialize, Serialize, Default)]
#[serde(default)]
pub struct EnvStore {
    /// Prepended to every key before the environment lookup.
    pub prefix: String,
    /// Resolve on every access instead of once at startup, picking up
    /// variables changed by the process itself.
    pub dynamic: bool,
}

impl EnvStore {
    fn var_name(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key.to_uppercase())
    }
}

impl SecretStore for EnvStore {
    fn init(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn get(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        let name = self.var_name(key);
        std::env::var(&name)
            .map(String::into_bytes)
            .map_err(|_| anyhow::anyhow!("environment variable {name:?} is not set"))
    }

    fn resolver(&self, key: &str) -> anyhow::Result<ResolveFn> {
        let name = self.var_name(key);
        let dynamic = self.dynamic;
        Ok(Box::new(move || {
            let value = std::env::var(&name)
                .map_err(|_| anyhow::anyhow!("environment variable {name:?} is not set"))?;
            Ok((value.into_bytes(), dynamic))
        }))
    }
}

impl StaticPlugin for EnvStore {
    fn name() -> &'static str {
        "env"
    }

    fn sample_config() -> &'static str {
        "  id = \"env\"\n  ## Prefix for the environment lookup, e.g. \"VANTAGE_SECRET_\".\n  # prefix = \"\"\n"
    }

    fn description() -> &'static str {
        "Read secrets from environment variables"
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn resolves_environment_variables() {
        std::env::set_var("VANTAGE_TEST_STORE_TOKEN", "hunter2");
        let store = EnvStore {
            prefix: "VANTAGE_TEST_STORE_".to_owned(),
            dynamic: false,
        };
        assert_eq!(store.get("token").unwrap(), b"hunter2");

        let resolver = store.resolver("token").unwrap();
        let (value, dynamic) = resolver().unwrap();
        assert_eq!(value, b"hunter2");
        assert!(!dynamic);
    }

    #[test]
    fn missing_variable_is_an_error() {
        let store = EnvStore::default();
        assert!(store.get("vantage_test_definitely_unset").is_err());
    }
}
