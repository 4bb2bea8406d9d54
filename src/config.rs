//! Client configuration: API endpoint, retry budget, worker counts, timeout.

use std::time::Duration;

use crate::error::Error;

/// Default MEGA API endpoint.
pub const API_URL: &str = "https://eu.api.mega.co.nz/cs";
/// Default retry budget for API requests and chunk fetches.
pub const RETRIES: u32 = 5;
/// Default number of parallel download workers.
pub const DOWNLOAD_WORKERS: usize = 3;
/// Hard cap on download workers.
pub const MAX_DOWNLOAD_WORKERS: usize = 6;
/// Default number of parallel upload workers.
pub const UPLOAD_WORKERS: usize = 1;
/// Hard cap on upload workers.
pub const MAX_UPLOAD_WORKERS: usize = 6;
/// Default timeout for a single HTTP exchange.
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Client configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) base_url: String,
    pub(crate) retries: u32,
    pub(crate) dl_workers: usize,
    pub(crate) ul_workers: usize,
    pub(crate) timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: API_URL.to_string(),
            retries: RETRIES,
            dl_workers: DOWNLOAD_WORKERS,
            ul_workers: UPLOAD_WORKERS,
            timeout: TIMEOUT,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the API base url (useful for the mirror endpoints).
    pub fn set_api_url(&mut self, url: impl Into<String>) {
        self.base_url = url.into();
    }

    /// Set the retry budget for API calls and chunk fetches.
    pub fn set_retries(&mut self, retries: u32) {
        self.retries = retries;
    }

    /// Set the number of concurrent download workers.
    pub fn set_download_workers(&mut self, workers: usize) -> Result<(), Error> {
        if workers > MAX_DOWNLOAD_WORKERS {
            return Err(Error::WorkerLimitExceeded(MAX_DOWNLOAD_WORKERS));
        }
        self.dl_workers = workers;
        Ok(())
    }

    /// Set the number of concurrent upload workers.
    pub fn set_upload_workers(&mut self, workers: usize) -> Result<(), Error> {
        if workers > MAX_UPLOAD_WORKERS {
            return Err(Error::WorkerLimitExceeded(MAX_UPLOAD_WORKERS));
        }
        self.ul_workers = workers;
        Ok(())
    }

    /// Set the timeout applied to each HTTP exchange.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.base_url, API_URL);
        assert_eq!(cfg.retries, 5);
        assert_eq!(cfg.dl_workers, 3);
        assert_eq!(cfg.ul_workers, 1);
        assert_eq!(cfg.timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_worker_caps() {
        let mut cfg = Config::new();
        assert!(cfg.set_download_workers(6).is_ok());
        assert!(matches!(
            cfg.set_download_workers(7),
            Err(Error::WorkerLimitExceeded(6))
        ));
        assert_eq!(cfg.dl_workers, 6);

        assert!(cfg.set_upload_workers(2).is_ok());
        assert!(matches!(
            cfg.set_upload_workers(64),
            Err(Error::WorkerLimitExceeded(6))
        ));
        assert_eq!(cfg.ul_workers, 2);
    }
}
