//! Deferred-resolved secrets held in protected memory.
//!
//! Any string-typed configuration field can be declared as a [`Secret`].
//! Its raw value may embed `@{store:key}` reference tokens which are linked
//! against the registered secret stores after the whole configuration has
//! been loaded. Static references are substituted once at link time; dynamic
//! references are re-resolved on every [`Secret::get`] so that rotating
//! credentials are picked up without a reload.

mod mem;
mod store;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use mem::SecretBuffer;
pub use store::{ResolveFn, SecretStore};
pub(crate) use store::split_reference;

/// Number of live secrets in protected memory, for startup diagnostics.
static SECRET_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Returns the number of secrets currently held in protected memory.
pub fn secret_count() -> usize {
    SECRET_COUNT.load(Ordering::Relaxed)
}

#[derive(Error, Debug)]
pub enum SecretError {
    /// The secret still contains reference tokens that no store resolved.
    #[error("unlinked parts in secret: {0}")]
    UnlinkedParts(String),
    #[error("linking secrets failed: {0}")]
    Linking(String),
    #[error("replacing secrets failed: {0}")]
    Replacing(String),
    /// A referenced store id is not registered.
    #[error("unknown secret-store for {0:?}")]
    UnknownStore(String),
    #[error("retrieving resolver for {token:?} failed: {source}")]
    Resolver {
        token: String,
        #[source]
        source: anyhow::Error,
    },
}

struct SecretInner {
    buffer: SecretBuffer,
    /// Reference tokens that have not been linked to a resolver yet.
    unlinked: Vec<String>,
    /// Resolvers retained for dynamic references.
    resolvers: BTreeMap<String, ResolveFn>,
    destroyed: bool,
}

/// A wipeable secret value, possibly containing `@{store:key}` references.
///
/// `Secret` is a shared handle: clones refer to the same underlying buffer,
/// which is how the binder can link the very instance a plugin holds.
#[derive(Clone)]
pub struct Secret {
    inner: Arc<Mutex<SecretInner>>,
}

impl Secret {
    /// Creates a secret from its raw (possibly reference-bearing) bytes.
    pub fn new(raw: impl AsRef<[u8]>) -> Self {
        let raw = raw.as_ref();
        let unlinked = find_references(raw);
        SECRET_COUNT.fetch_add(1, Ordering::Relaxed);
        Secret {
            inner: Arc::new(Mutex::new(SecretInner {
                buffer: SecretBuffer::new(raw.to_vec()),
                unlinked,
                resolvers: BTreeMap::new(),
                destroyed: false,
            })),
        }
    }

    /// The reference tokens that still need linking.
    pub fn unlinked(&self) -> Vec<String> {
        self.lock().unlinked.clone()
    }

    /// True when the raw value is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().buffer.is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SecretInner> {
        // A panic while holding the lock leaves no interesting state behind:
        // recover the guard instead of propagating the poison.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Links the reference tokens against `resolvers`.
    ///
    /// Static results are substituted into the buffer immediately; dynamic
    /// results keep their resolver for re-resolution in [`get`](Self::get).
    /// Tokens without a resolver are collected and reported together; the
    /// remaining tokens still link.
    pub fn link(&self, mut resolvers: BTreeMap<String, ResolveFn>) -> Result<(), SecretError> {
        let mut inner = self.lock();
        let tokens = find_references(inner.buffer.bytes());
        let mut missing = Vec::new();
        let mut replacements = Vec::new();

        for token in &tokens {
            match resolvers.remove(token) {
                None => missing.push(token.clone()),
                Some(resolver) => {
                    let (value, dynamic) = resolver()
                        .map_err(|e| SecretError::Linking(format!("resolving {token:?} failed: {e}")))?;
                    if dynamic {
                        inner.resolvers.insert(token.clone(), resolver);
                    } else {
                        replacements.push((token.clone(), value));
                    }
                }
            }
        }

        if !replacements.is_empty() {
            let replaced = substitute_tokens(inner.buffer.bytes(), &replacements);
            inner.buffer.replace(replaced);
        }

        if missing.is_empty() {
            inner.unlinked.clear();
            Ok(())
        } else {
            inner.unlinked = missing.clone();
            let parts: Vec<String> = missing.iter().map(|t| format!("unlinked part {t:?}")).collect();
            Err(SecretError::Linking(parts.join("; ")))
        }
    }

    /// Resolves and returns the secret value.
    ///
    /// The returned [`SecretValue`] is a protected copy that is wiped when
    /// dropped. Dynamic references are re-resolved on every call.
    pub fn get(&self) -> Result<SecretValue, SecretError> {
        let inner = self.lock();
        if !inner.unlinked.is_empty() {
            return Err(SecretError::UnlinkedParts(inner.unlinked.join(", ")));
        }
        if inner.resolvers.is_empty() {
            return Ok(SecretValue {
                buffer: inner.buffer.duplicate(),
            });
        }

        // Dynamic references: substitute on a fresh copy of the raw value.
        let tokens = find_references(inner.buffer.bytes());
        let mut errors = Vec::new();
        let mut replacements = Vec::new();
        for token in &tokens {
            match inner.resolvers.get(token) {
                None => errors.push(format!("no resolver for {token:?}")),
                Some(resolver) => match resolver() {
                    Ok((value, _)) => replacements.push((token.clone(), value)),
                    Err(e) => errors.push(format!("resolving {token:?} failed: {e}")),
                },
            }
        }
        if !errors.is_empty() {
            return Err(SecretError::Replacing(errors.join("; ")));
        }
        Ok(SecretValue {
            buffer: SecretBuffer::new(substitute_tokens(inner.buffer.bytes(), &replacements)),
        })
    }

    /// Wipes the secret and releases its resolvers. Idempotent.
    pub fn destroy(&self) {
        let mut inner = self.lock();
        if !inner.destroyed {
            inner.destroyed = true;
            SECRET_COUNT.fetch_sub(1, Ordering::Relaxed);
        }
        inner.buffer.wipe();
        inner.resolvers.clear();
        inner.unlinked.clear();
    }
}

impl Default for Secret {
    fn default() -> Self {
        Secret::new([])
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never reveal the contents.
        f.write_str("Secret(***)")
    }
}

impl From<&str> for Secret {
    fn from(raw: &str) -> Self {
        Secret::new(raw.as_bytes())
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        // Secrets never serialize their value; the newtype name lets the
        // schema reflector classify the field.
        serializer.serialize_newtype_struct("Secret", "")
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let secret = Secret::new(raw.as_bytes());
        register_pending(&secret);
        Ok(secret)
    }
}

/// A resolved secret value. Wiped when dropped.
pub struct SecretValue {
    buffer: SecretBuffer,
}

impl SecretValue {
    pub fn bytes(&self) -> &[u8] {
        self.buffer.bytes()
    }

    /// Borrows the value as UTF-8 text.
    pub fn as_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(self.buffer.bytes())
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue(***)")
    }
}

/// Finds every `@{store:key}` reference token in `raw`, in order, without
/// duplicates.
fn find_references(raw: &[u8]) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut i = 0;
    while i + 1 < raw.len() {
        if raw[i] == b'@' && raw[i + 1] == b'{' {
            if let Some(rel_end) = raw[i..].iter().position(|&b| b == b'}') {
                let inner = &raw[i + 2..i + rel_end];
                if is_reference_body(inner) {
                    // token includes the delimiters
                    if let Ok(token) = std::str::from_utf8(&raw[i..=i + rel_end]) {
                        if !tokens.iter().any(|t| t == token) {
                            tokens.push(token.to_owned());
                        }
                    }
                    i += rel_end + 1;
                    continue;
                }
            }
        }
        i += 1;
    }
    tokens
}

/// A reference body is `store:key` with both parts `[A-Za-z0-9_]+`.
fn is_reference_body(inner: &[u8]) -> bool {
    let Some(colon) = inner.iter().position(|&b| b == b':') else {
        return false;
    };
    let (store, key) = (&inner[..colon], &inner[colon + 1..]);
    let word = |part: &[u8]| {
        !part.is_empty() && part.iter().all(|&b| b.is_ascii_alphanumeric() || b == b'_')
    };
    word(store) && word(key)
}

fn substitute_tokens(raw: &[u8], replacements: &[(String, Vec<u8>)]) -> Vec<u8> {
    let mut out = raw.to_vec();
    for (token, value) in replacements {
        // single left-to-right pass, so a value containing the token text
        // is not substituted again
        let mut replaced = Vec::with_capacity(out.len());
        let mut i = 0;
        while i < out.len() {
            if out[i..].starts_with(token.as_bytes()) {
                replaced.extend_from_slice(value);
                i += token.len();
            } else {
                replaced.push(out[i]);
                i += 1;
            }
        }
        out = replaced;
    }
    out
}

thread_local! {
    /// Stack of secret collectors, one frame per in-progress plugin binding.
    static PENDING_SECRETS: RefCell<Vec<Vec<Secret>>> = const { RefCell::new(Vec::new()) };
}

fn register_pending(secret: &Secret) {
    PENDING_SECRETS.with(|pending| {
        if let Some(frame) = pending.borrow_mut().last_mut() {
            frame.push(secret.clone());
        }
    });
}

/// Runs `f` with a fresh secret collector and returns what it produced
/// together with every [`Secret`] deserialized while it ran.
///
/// The collector is thread-local, so loads of independent documents from
/// different threads do not observe each other's secrets.
pub(crate) fn collect_secrets<T>(f: impl FnOnce() -> T) -> (T, Vec<Secret>) {
    PENDING_SECRETS.with(|pending| pending.borrow_mut().push(Vec::new()));
    let result = f();
    let collected = PENDING_SECRETS
        .with(|pending| pending.borrow_mut().pop())
        .unwrap_or_default();
    (result, collected)
}

/// Links every secret in `secrets` against the registered `stores`.
///
/// Secrets without reference tokens are skipped. An unknown store id fails
/// the whole pass; the affected secrets stay unlinked and their `get` keeps
/// reporting the unlinked parts.
pub fn link_secrets(
    secrets: &[Secret],
    stores: &BTreeMap<String, Box<dyn SecretStore>>,
) -> Result<(), SecretError> {
    for secret in secrets {
        let unlinked = secret.unlinked();
        if unlinked.is_empty() {
            continue;
        }
        let mut resolvers: BTreeMap<String, ResolveFn> = BTreeMap::new();
        for token in unlinked {
            let Some((store_id, key)) = split_reference(&token) else {
                return Err(SecretError::UnknownStore(token));
            };
            let store = stores
                .get(store_id)
                .ok_or_else(|| SecretError::UnknownStore(token.clone()))?;
            let resolver = store.resolver(key).map_err(|source| SecretError::Resolver {
                token: token.clone(),
                source,
            })?;
            resolvers.insert(token, resolver);
        }
        secret.link(resolvers)?;
    }
    Ok(())
}
