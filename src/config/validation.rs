use crate::config::types::{Config, CrawlerConfig, OutputConfig, ScopeConfig, SeedConfig, WriterConfig};
use crate::ConfigError;
use scraper::Selector;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_crawler_config(&config.crawler)?;
    validate_writer_config(&config.writer)?;
    validate_output_config(&config.output)?;
    validate_scope_config(&config.scope)?;
    validate_seeds(&config.seeds)?;
    Ok(())
}

/// Validates worker pool and retry settings
fn validate_crawler_config(config: &CrawlerConfig) -> Result<(), ConfigError> {
    if config.worker_count < 1 || config.worker_count > 256 {
        return Err(ConfigError::Validation(format!(
            "worker-count must be between 1 and 256, got {}",
            config.worker_count
        )));
    }

    if config.max_attempts < 1 {
        return Err(ConfigError::Validation(format!(
            "max-attempts must be >= 1, got {}",
            config.max_attempts
        )));
    }

    if config.backoff_cap_ms < config.base_backoff_ms {
        return Err(ConfigError::Validation(format!(
            "backoff-cap-ms ({}) must be >= base-backoff-ms ({})",
            config.backoff_cap_ms, config.base_backoff_ms
        )));
    }

    if config.per_fetch_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "per-fetch-timeout-ms must be > 0".to_string(),
        ));
    }

    if config.completion_poll_ms == 0 || config.idle_poll_ms == 0 {
        return Err(ConfigError::Validation(
            "completion-poll-ms and idle-poll-ms must be > 0".to_string(),
        ));
    }

    Ok(())
}

/// Validates writer batching settings
fn validate_writer_config(config: &WriterConfig) -> Result<(), ConfigError> {
    if config.batch_size < 1 {
        return Err(ConfigError::Validation(format!(
            "batch-size must be >= 1, got {}",
            config.batch_size
        )));
    }

    if config.flush_interval_ms == 0 {
        return Err(ConfigError::Validation(
            "flush-interval-ms must be > 0".to_string(),
        ));
    }

    // The channel must hold at least one full batch or the writer can never fill one
    if config.channel_capacity < config.batch_size {
        return Err(ConfigError::Validation(format!(
            "channel-capacity ({}) must be >= batch-size ({})",
            config.channel_capacity, config.batch_size
        )));
    }

    Ok(())
}

/// Validates output configuration
fn validate_output_config(config: &OutputConfig) -> Result<(), ConfigError> {
    if config.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database-path cannot be empty".to_string(),
        ));
    }

    Ok(())
}

/// Validates the crawl scope filters
fn validate_scope_config(config: &ScopeConfig) -> Result<(), ConfigError> {
    if let Some(prefix) = &config.url_prefix {
        validate_http_url(prefix, "url-prefix")?;
    }

    if let Some(domain) = &config.allowed_domain {
        validate_host(domain)?;
    }

    if let Some(selector) = &config.content_selector {
        Selector::parse(selector).map_err(|_| {
            ConfigError::Validation(format!("Invalid content-selector '{}'", selector))
        })?;
    }

    Ok(())
}

/// Validates seed URLs
fn validate_seeds(config: &SeedConfig) -> Result<(), ConfigError> {
    for seed in &config.urls {
        validate_http_url(seed, "seed")?;
    }
    Ok(())
}

fn validate_http_url(value: &str, what: &str) -> Result<(), ConfigError> {
    let url = Url::parse(value)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid {} '{}': {}", what, value, e)))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ConfigError::Validation(format!(
            "{} '{}' must use http or https",
            what, value
        )));
    }

    Ok(())
}

/// Validates a bare host name
fn validate_host(host: &str) -> Result<(), ConfigError> {
    if host.is_empty() {
        return Err(ConfigError::Validation(
            "allowed-domain cannot be empty".to_string(),
        ));
    }

    if !host
        .chars()
        .all(|c| c.is_alphanumeric() || c == '.' || c == '-')
    {
        return Err(ConfigError::Validation(format!(
            "allowed-domain '{}' contains invalid characters",
            host
        )));
    }

    if host.starts_with('.') || host.ends_with('.') || host.contains("..") {
        return Err(ConfigError::Validation(format!(
            "allowed-domain '{}' is malformed",
            host
        )));
    }

    Ok(())
}
