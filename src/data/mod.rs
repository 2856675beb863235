use std::io;
use std::path::{Path, PathBuf};

use futures::future::{FutureExt, LocalBoxFuture};
use log::debug;
use reqwest::Client;

use crate::service::{Fetch, TransportError};

type Body = Result<Vec<u8>, TransportError>;

/// Reads overlay payloads from disk, relative to a data directory
#[derive(Clone, Debug)]
pub struct FileFetcher {
    root: PathBuf,
}

impl FileFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Absolute locators are used as-is
    pub fn resolve(&self, locator: &str) -> PathBuf {
        let path = Path::new(locator.strip_prefix("file://").unwrap_or(locator));
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

impl Fetch for FileFetcher {
    fn fetch(&self, locator: &str) -> LocalBoxFuture<'static, Body> {
        let path = self.resolve(locator);
        async move {
            debug!("Reading {}", path.display());
            tokio::fs::read(&path).await.map_err(|err| match err.kind() {
                io::ErrorKind::NotFound => TransportError::Status(404),
                _ => TransportError::Network(format!("{}: {}", path.display(), err)),
            })
        }
        .boxed_local()
    }
}

/// GETs overlay payloads over HTTP(S)
#[derive(Clone, Debug, Default)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl Fetch for HttpFetcher {
    fn fetch(&self, locator: &str) -> LocalBoxFuture<'static, Body> {
        let client = self.client.clone();
        let url = locator.to_string();
        async move {
            debug!("GET {}", url);
            let response = client
                .get(&url)
                .send()
                .await
                .map_err(|err| TransportError::Network(err.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(TransportError::Status(status.as_u16()));
            }

            let bytes = response
                .bytes()
                .await
                .map_err(|err| TransportError::Network(err.to_string()))?;
            Ok(bytes.to_vec())
        }
        .boxed_local()
    }
}

pub fn is_remote(locator: &str) -> bool {
    locator.starts_with("http://") || locator.starts_with("https://")
}

/// Routes URL locators to HTTP and everything else to the data directory
#[derive(Clone, Debug)]
pub struct SourceFetcher {
    files: FileFetcher,
    http: HttpFetcher,
}

impl SourceFetcher {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            files: FileFetcher::new(data_dir),
            http: HttpFetcher::default(),
        }
    }
}

impl Fetch for SourceFetcher {
    fn fetch(&self, locator: &str) -> LocalBoxFuture<'static, Body> {
        if is_remote(locator) {
            self.http.fetch(locator)
        } else {
            self.files.fetch(locator)
        }
    }
}
