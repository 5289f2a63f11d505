use std::path::PathBuf;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Size of the transfer handle pool; the hard cap on in-flight requests.
    /// The first `max(1, max_handles / 4)` slots keep their native handle for
    /// the engine's lifetime, the rest create one lazily and drop it after
    /// two minutes of idleness.
    pub max_handles: usize,
    /// Route libcurl's protocol trace through `tracing` at TRACE level, and
    /// trace response bodies of HTTP >= 400 answers.
    pub verbose: bool,
    /// Verify TLS peer certificates and hostnames. Off by default: the
    /// engine trusts the transport it is pointed at.
    pub verify_certificates: bool,
    /// CA bundle to verify against. When unset and verification is on, a
    /// handful of well-known bundle locations are probed.
    pub ca_bundle: Option<PathBuf>,
    /// Log per-transfer timing statistics at DEBUG level on completion.
    pub collect_statistics: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_handles: 32,
            verbose: false,
            verify_certificates: false,
            ca_bundle: None,
            collect_statistics: false,
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out
    /// of range.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if self.max_handles == 0 {
            return Err(crate::error::Error::Config(
                "max_handles must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Number of pool slots whose native handle lives as long as the engine.
    pub(crate) fn static_handle_count(&self) -> usize {
        (self.max_handles / 4).max(1)
    }
}

/// Builder for [`Config`] with discoverable methods and `build()` validation.
///
/// # Example
///
/// ```rust
/// use tidepool::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .max_handles(64)
///     .verbose(false)
///     .build()
///     .expect("invalid config");
/// ```
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default config values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the transfer handle pool size.
    pub fn max_handles(mut self, n: usize) -> Self {
        self.config.max_handles = n;
        self
    }

    /// Enable or disable libcurl protocol tracing.
    pub fn verbose(mut self, enable: bool) -> Self {
        self.config.verbose = enable;
        self
    }

    /// Enable or disable TLS certificate verification.
    pub fn verify_certificates(mut self, enable: bool) -> Self {
        self.config.verify_certificates = enable;
        self
    }

    /// Set an explicit CA bundle path.
    pub fn ca_bundle(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.ca_bundle = Some(path.into());
        self
    }

    /// Enable or disable per-transfer timing statistics.
    pub fn collect_statistics(mut self, enable: bool) -> Self {
        self.config.collect_statistics = enable;
        self
    }

    /// Validate and build the final [`Config`].
    pub fn build(self) -> Result<Config, crate::error::Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn zero_handles_rejected() {
        let result = ConfigBuilder::new().max_handles(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn static_count_is_a_quarter_with_floor_one() {
        let mut config = Config::default();
        config.max_handles = 32;
        assert_eq!(config.static_handle_count(), 8);
        config.max_handles = 3;
        assert_eq!(config.static_handle_count(), 1);
        config.max_handles = 1;
        assert_eq!(config.static_handle_count(), 1);
    }

    #[test]
    fn builder_sets_fields() {
        let config = ConfigBuilder::new()
            .max_handles(8)
            .verbose(true)
            .verify_certificates(true)
            .ca_bundle("/tmp/bundle.crt")
            .collect_statistics(true)
            .build()
            .unwrap();
        assert_eq!(config.max_handles, 8);
        assert!(config.verbose);
        assert!(config.verify_certificates);
        assert_eq!(config.ca_bundle.as_deref(), Some(std::path::Path::new("/tmp/bundle.crt")));
        assert!(config.collect_statistics);
    }
}
