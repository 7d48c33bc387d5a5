//! Startup: config, descriptors, transport, client.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use escrow_config::{ConfigError, EscrowConfig, RetrySection};
use escrow_core::{ClientOptions, EscrowClient, InitializationError};
use escrow_transport::retry::RetryConfig;
use escrow_transport::{EvmOptions, EvmTransport};

use crate::crash_hardening::{self, DumpPolicy};

fn config_error(err: impl std::error::Error + Send + Sync + 'static) -> InitializationError {
    InitializationError::Config(Box::new(err))
}

/// Map the `[retry]` section onto the transport's retry policy.
pub fn retry_config(section: Option<&RetrySection>) -> RetryConfig {
    let mut retry = RetryConfig::default();
    let Some(section) = section else {
        return retry;
    };
    if let Some(max_retries) = section.max_retries {
        retry.max_retries = max_retries;
    }
    if let Some(ms) = section.initial_delay_ms {
        retry.initial_delay = Duration::from_millis(ms);
    }
    if let Some(ms) = section.max_delay_ms {
        retry.max_delay = Duration::from_millis(ms);
    }
    if retry.max_delay < retry.initial_delay {
        retry.max_delay = retry.initial_delay;
    }
    retry
}

/// Read the config file, which carries party private keys, with core dumps disabled.
pub fn load_config() -> Result<(PathBuf, EscrowConfig), ConfigError> {
    match crash_hardening::guard_key_material() {
        Ok(DumpPolicy::Disabled) => tracing::debug!("Core dumps disabled"),
        Ok(DumpPolicy::AllowedByOverride) => {}
        Err(err) => tracing::warn!(error = %err, "Could not disable core dumps"),
    }
    EscrowConfig::load()
}

/// Everything needed before the first escrow call. Any failure here aborts the process.
pub async fn connect(config: &EscrowConfig) -> Result<EscrowClient, InitializationError> {
    config.validate().map_err(config_error)?;
    let url = config.rpc_url().map_err(config_error)?;
    let identities = config.identities().map_err(config_error)?;
    let contract = config.contract_address().map_err(config_error)?;
    let interface = config.contract_interface().map_err(config_error)?;
    tracing::info!(
        endpoint = %url,
        contract = %contract,
        functions = interface.functions().count(),
        "Descriptors loaded"
    );

    let options = EvmOptions {
        expected_chain_id: config.endpoint.chain_id,
        allow_insecure_http: config.endpoint.allow_insecure_http,
        retry: retry_config(config.retry.as_ref()),
        gas_multiplier_percent: config.gas_multiplier_percent(),
        request_timeout: None,
    };
    let transport = EvmTransport::new(url, options).map_err(config_error)?;

    EscrowClient::connect(
        Arc::new(transport),
        interface,
        contract,
        identities,
        ClientOptions {
            inclusion_timeout: config.inclusion_timeout(),
            poll_interval: config.poll_interval(),
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_retry_section_keeps_defaults() {
        let retry = retry_config(None);
        assert_eq!(retry.max_retries, RetryConfig::default().max_retries);
    }

    #[test]
    fn retry_section_overrides_fields() {
        let section = RetrySection {
            max_retries: Some(5),
            initial_delay_ms: Some(100),
            max_delay_ms: None,
        };
        let retry = retry_config(Some(&section));
        assert_eq!(retry.max_retries, 5);
        assert_eq!(retry.initial_delay, Duration::from_millis(100));
        assert_eq!(retry.max_delay, RetryConfig::default().max_delay);
    }

    #[test]
    fn max_delay_never_below_initial() {
        let section = RetrySection {
            max_retries: None,
            initial_delay_ms: Some(2_000),
            max_delay_ms: Some(10),
        };
        let retry = retry_config(Some(&section));
        assert_eq!(retry.max_delay, Duration::from_secs(2));
    }
}
