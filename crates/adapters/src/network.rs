use std::time::Duration;

use once_cell::sync::OnceCell;
use reqwest::blocking::Client;
use reqwest::Proxy;

use quill_core::NetworkConfig;

use crate::error::AdapterError;
use crate::retry::RetryConfig;

/// Everything an adapter needs besides its profile.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AdapterOptions {
    pub network: NetworkConfig,
    pub retry: RetryConfig,
}

impl AdapterOptions {
    pub fn new(network: NetworkConfig) -> Self {
        Self {
            network,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// Builds a blocking client that uses exactly the configured proxy. With no
/// proxy configured, proxy environment variables are ignored too.
pub fn build_client(network: &NetworkConfig, timeout: Duration) -> Result<Client, AdapterError> {
    let builder = Client::builder().timeout(timeout);
    let builder = match network.proxy() {
        Some(url) => builder.proxy(Proxy::all(url)?),
        None => builder.no_proxy(),
    };
    Ok(builder.build()?)
}

/// Client built on first use, so constructing an adapter never fails.
pub(crate) struct LazyClient {
    network: NetworkConfig,
    timeout: Duration,
    cell: OnceCell<Client>,
}

impl LazyClient {
    pub(crate) fn new(network: &NetworkConfig, timeout: Duration) -> Self {
        Self {
            network: network.clone(),
            timeout,
            cell: OnceCell::new(),
        }
    }

    pub(crate) fn get(&self) -> Result<&Client, AdapterError> {
        self.cell
            .get_or_try_init(|| build_client(&self.network, self.timeout))
    }
}
