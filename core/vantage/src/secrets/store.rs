//! The capability surface of secret-store plugins.

/// Resolves one secret key. Returns the current value and whether the value
/// is dynamic, i.e. must be re-resolved on every access instead of being
/// substituted once.
pub type ResolveFn = Box<dyn Fn() -> anyhow::Result<(Vec<u8>, bool)> + Send + Sync>;

/// A named provider of secret values, declared as a `[[secretstores.*]]`
/// block and registered under its `id`.
pub trait SecretStore: Send + Sync {
    /// Called once after the store's own configuration has been bound.
    fn init(&mut self) -> anyhow::Result<()>;

    /// Fetches the current value of `key`.
    fn get(&self, key: &str) -> anyhow::Result<Vec<u8>>;

    /// Builds a resolver for `key`, used to link `@{store:key}` references.
    fn resolver(&self, key: &str) -> anyhow::Result<ResolveFn>;
}

/// Splits a `@{store:key}` reference token into its store id and key.
pub(crate) fn split_reference(token: &str) -> Option<(&str, &str)> {
    token
        .strip_prefix("@{")
        .and_then(|t| t.strip_suffix('}'))
        .and_then(|t| t.split_once(':'))
}
