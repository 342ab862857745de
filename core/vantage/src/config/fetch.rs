//! Sourcing of configuration documents: local files, directories of `.conf`
//! files, and remote `http`/`https` locations.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Bearer token sent to remote config servers when set in the environment.
const TOKEN_ENV_VAR: &str = "VANTAGE_TOKEN";

const FETCH_RETRIES: u32 = 3;
const FETCH_RETRY_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("could not read config file {path}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("config file {path} is not valid UTF-8 text")]
    NotText { path: String },
    #[error("scheme {scheme:?} is not supported for config sources")]
    UnsupportedScheme { scheme: String },
    #[error("fetching remote config {url} failed")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("retry {retries} of {retries} failed to retrieve remote config {url}: status {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
        retries: u32,
    },
    #[error(
        "no config file specified, and could not find one in $VANTAGE_CONFIG_PATH, \
         $HOME/.vantage/vantage.conf or /etc/vantage"
    )]
    NoDefaultConfig,
}

/// Returns the URL when `source` designates a remote location.
pub fn parse_url(source: &str) -> Option<reqwest::Url> {
    if !source.contains("://") {
        return None;
    }
    reqwest::Url::parse(source).ok()
}

/// Loads one configuration source and reports whether it was remote.
pub fn load_source(source: &str) -> Result<(String, bool), FetchError> {
    if let Some(url) = parse_url(source) {
        return match url.scheme() {
            "http" | "https" => fetch_remote(&url).map(|text| (text, true)),
            other => Err(FetchError::UnsupportedScheme {
                scheme: other.to_owned(),
            }),
        };
    }

    let bytes = std::fs::read(source).map_err(|source_err| FetchError::Read {
        path: source.to_owned(),
        source: source_err,
    })?;
    let text = String::from_utf8(trim_bom(bytes)).map_err(|_| FetchError::NotText {
        path: source.to_owned(),
    })?;
    Ok((text, false))
}

/// Strips a UTF-8 byte-order mark. Editors on Windows like to add one.
fn trim_bom(mut bytes: Vec<u8>) -> Vec<u8> {
    if bytes.starts_with(&[0xef, 0xbb, 0xbf]) {
        bytes.drain(..3);
    }
    bytes
}

fn fetch_remote(url: &reqwest::Url) -> Result<String, FetchError> {
    let transport = |source| FetchError::Transport {
        url: url.to_string(),
        source,
    };

    let client = reqwest::blocking::Client::builder()
        .user_agent(concat!("vantage/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(transport)?;

    for attempt in 0..=FETCH_RETRIES {
        let mut request = client.get(url.clone()).header("Accept", "application/toml");
        if let Ok(token) = std::env::var(TOKEN_ENV_VAR) {
            request = request.header("Authorization", format!("Token {token}"));
        }

        let response = request.send().map_err(transport)?;
        let status = response.status();
        if status.is_success() {
            return response.text().map_err(transport);
        }
        if attempt < FETCH_RETRIES {
            log::warn!(
                "error getting remote config (status {status}), retry {} of {FETCH_RETRIES} in {}s",
                attempt + 1,
                FETCH_RETRY_INTERVAL.as_secs()
            );
            std::thread::sleep(FETCH_RETRY_INTERVAL);
            continue;
        }
        return Err(FetchError::Status {
            url: url.to_string(),
            status,
            retries: FETCH_RETRIES,
        });
    }
    unreachable!("retry loop returns on the last attempt")
}

/// Recursively collects the `.conf` files under `path`, in lexical order.
///
/// Directories whose name starts with `..` are skipped: Kubernetes mounts
/// materialize as `..data` symlink trees and would load every file twice.
pub fn walk_directory(path: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    walk_into(path, &mut files)?;
    Ok(files)
}

fn walk_into(dir: &Path, files: &mut Vec<PathBuf>) -> io::Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if entry.file_type()?.is_dir() {
            if name.starts_with("..") {
                continue;
            }
            walk_into(&path, files)?;
        } else if name.ends_with(".conf") {
            files.push(path);
        }
    }
    Ok(())
}

/// Finds the default configuration sources, in order of preference:
/// `$VANTAGE_CONFIG_PATH`, `$HOME/.vantage/vantage.conf`, then
/// `/etc/vantage/vantage.conf` plus `/etc/vantage/vantage.d/*.conf`.
pub fn default_config_paths() -> Result<Vec<String>, FetchError> {
    let mut candidates = Vec::new();
    if let Ok(env_path) = std::env::var("VANTAGE_CONFIG_PATH") {
        candidates.push(env_path);
    }
    if let Ok(home) = std::env::var("HOME") {
        candidates.push(format!("{home}/.vantage/vantage.conf"));
    }

    for candidate in candidates {
        if parse_url(&candidate).is_some() {
            return Ok(vec![candidate]);
        }
        if Path::new(&candidate).exists() {
            return Ok(vec![candidate]);
        }
    }

    let etc_file = Path::new("/etc/vantage/vantage.conf");
    let etc_dir = Path::new("/etc/vantage/vantage.d");
    let mut found = Vec::new();
    if etc_file.exists() {
        found.push(etc_file.to_string_lossy().into_owned());
    }
    if etc_dir.is_dir() {
        match walk_directory(etc_dir) {
            Ok(files) => found.extend(files.iter().map(|p| p.to_string_lossy().into_owned())),
            Err(e) => log::warn!("unable to walk {}: {e}", etc_dir.display()),
        }
    }
    if found.is_empty() {
        Err(FetchError::NoDefaultConfig)
    } else {
        Ok(found)
    }
}
