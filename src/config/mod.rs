//! Configuration for the wallet host.
//!
//! Settings are layered with priority: `PM_SET_CONFIG` patch > env var > default.
//! The env layer is read once at startup (after `dotenvy` has loaded `.env`);
//! every later `PM_SET_CONFIG` is merged on top of the accumulated patch, so
//! fields the application omits keep their previous value.

mod confirmation;
pub(crate) mod helpers;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::observability::ObservabilityConfig;

pub use self::confirmation::{
    ConfirmBehavior, ConfirmUiMode, ConfirmationConfig, ConfirmationPatch, Theme,
};

/// Default signer worker pool capacity.
pub const DEFAULT_POOL_CAPACITY: usize = 3;
/// Default attach-port acknowledgement window.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 2_000;
/// Default full round-trip window for one worker operation.
pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 60_000;
/// Default idle signing session lifetime.
pub const DEFAULT_SESSION_TTL_SECS: u64 = 300;
/// Default readiness window for a freshly spawned worker.
pub const DEFAULT_HEALTH_CHECK_TIMEOUT_MS: u64 = 5_000;
/// Default interval between expired-session sweeps.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;

/// Timing and sizing for the signer worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    pub capacity: usize,
    pub handshake_timeout: Duration,
    pub operation_timeout: Duration,
    pub session_ttl: Duration,
    pub health_check_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_POOL_CAPACITY,
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            operation_timeout: Duration::from_millis(DEFAULT_OPERATION_TIMEOUT_MS),
            session_ttl: Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
            health_check_timeout: Duration::from_millis(DEFAULT_HEALTH_CHECK_TIMEOUT_MS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        }
    }
}

/// Fully resolved host configuration.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub near_rpc_url: String,
    pub contract_id: String,
    pub relayer_url: Option<String>,
    pub rp_id_override: Option<String>,
    pub near_explorer_url: Option<String>,
    pub initial_account_balance: Option<String>,
    pub pool: WorkerPoolConfig,
    pub confirmation: ConfirmationConfig,
}

/// Partial configuration, the wire shape of `PM_SET_CONFIG`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HostConfigPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub near_rpc_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relayer_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rp_id_override: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub near_explorer_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_account_balance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_pool_capacity: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handshake_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_ttl_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sweep_interval_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation: Option<ConfirmationPatch>,
}

macro_rules! merge_fields {
    ($target:ident, $other:ident, $($field:ident),+ $(,)?) => {
        $(
            if $other.$field.is_some() {
                $target.$field = $other.$field;
            }
        )+
    };
}

impl HostConfigPatch {
    /// Build the env layer: `NEAR_RPC_URL`, `WALLET_CONTRACT_ID`, etc.
    pub fn from_env() -> Result<Self, ConfigError> {
        let confirmation = ConfirmationPatch {
            behavior: helpers::optional_env("WALLET_CONFIRM_BEHAVIOR")?
                .map(|v| ConfirmBehavior::parse(&v, "WALLET_CONFIRM_BEHAVIOR"))
                .transpose()?,
            ui_mode: helpers::optional_env("WALLET_CONFIRM_UI_MODE")?
                .map(|v| ConfirmUiMode::parse(&v, "WALLET_CONFIRM_UI_MODE"))
                .transpose()?,
            auto_proceed_delay_ms: helpers::parse_optional_env("WALLET_AUTO_PROCEED_DELAY_MS")?,
            theme: helpers::optional_env("WALLET_THEME")?
                .map(|v| Theme::parse(&v, "WALLET_THEME"))
                .transpose()?,
        };
        let confirmation = (confirmation != ConfirmationPatch::default()).then_some(confirmation);

        Ok(Self {
            near_rpc_url: helpers::optional_env("NEAR_RPC_URL")?,
            contract_id: helpers::optional_env("WALLET_CONTRACT_ID")?,
            relayer_url: helpers::optional_env("WALLET_RELAYER_URL")?,
            rp_id_override: helpers::optional_env("WALLET_RP_ID")?,
            near_explorer_url: helpers::optional_env("NEAR_EXPLORER_URL")?,
            initial_account_balance: helpers::optional_env("WALLET_INITIAL_BALANCE")?,
            worker_pool_capacity: helpers::parse_optional_env("WALLET_WORKER_POOL_CAPACITY")?,
            handshake_timeout_ms: helpers::parse_optional_env("WALLET_HANDSHAKE_TIMEOUT_MS")?,
            operation_timeout_ms: helpers::parse_optional_env("WALLET_OPERATION_TIMEOUT_MS")?,
            session_ttl_secs: helpers::parse_optional_env("WALLET_SESSION_TTL_SECS")?,
            health_check_timeout_ms: helpers::parse_optional_env(
                "WALLET_HEALTH_CHECK_TIMEOUT_MS",
            )?,
            sweep_interval_secs: helpers::parse_optional_env("WALLET_SWEEP_INTERVAL_SECS")?,
            confirmation,
        })
    }

    /// Overlay `other` on top of `self`: present fields override, omitted fields are kept.
    pub fn merge(&mut self, other: HostConfigPatch) {
        merge_fields!(
            self,
            other,
            near_rpc_url,
            contract_id,
            relayer_url,
            rp_id_override,
            near_explorer_url,
            initial_account_balance,
            worker_pool_capacity,
            handshake_timeout_ms,
            operation_timeout_ms,
            session_ttl_secs,
            health_check_timeout_ms,
            sweep_interval_secs,
        );
        if let Some(confirmation) = other.confirmation {
            self.confirmation
                .get_or_insert_with(ConfirmationPatch::default)
                .merge(confirmation);
        }
    }
}

fn require(value: &Option<String>, key: &str, hint: &str) -> Result<String, ConfigError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .ok_or_else(|| ConfigError::MissingRequired {
            key: key.to_string(),
            hint: hint.to_string(),
        })
}

fn positive(value: Option<u64>, default: u64, key: &str) -> Result<u64, ConfigError> {
    let value = value.unwrap_or(default);
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be > 0".to_string(),
        });
    }
    Ok(value)
}

fn validate_url(value: &str, key: &str) -> Result<(), ConfigError> {
    url::Url::parse(value)
        .map(|_| ())
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("must be an absolute URL: {e}"),
        })
}

impl HostConfig {
    /// Validate an accumulated patch into a usable configuration.
    ///
    /// Fails before any worker or network resource is touched.
    pub fn resolve(patch: &HostConfigPatch) -> Result<Self, ConfigError> {
        let near_rpc_url = require(
            &patch.near_rpc_url,
            "nearRpcUrl",
            "Pass it in PM_SET_CONFIG or set NEAR_RPC_URL.",
        )?;
        validate_url(&near_rpc_url, "nearRpcUrl")?;

        let contract_id = require(
            &patch.contract_id,
            "contractId",
            "Pass it in PM_SET_CONFIG or set WALLET_CONTRACT_ID.",
        )?;

        if let Some(relayer_url) = &patch.relayer_url {
            validate_url(relayer_url, "relayerUrl")?;
        }

        let capacity = patch.worker_pool_capacity.unwrap_or(DEFAULT_POOL_CAPACITY);
        if capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "workerPoolCapacity".to_string(),
                message: "must be > 0".to_string(),
            });
        }

        let pool = WorkerPoolConfig {
            capacity,
            handshake_timeout: Duration::from_millis(positive(
                patch.handshake_timeout_ms,
                DEFAULT_HANDSHAKE_TIMEOUT_MS,
                "handshakeTimeoutMs",
            )?),
            operation_timeout: Duration::from_millis(positive(
                patch.operation_timeout_ms,
                DEFAULT_OPERATION_TIMEOUT_MS,
                "operationTimeoutMs",
            )?),
            session_ttl: Duration::from_secs(positive(
                patch.session_ttl_secs,
                DEFAULT_SESSION_TTL_SECS,
                "sessionTtlSecs",
            )?),
            health_check_timeout: Duration::from_millis(positive(
                patch.health_check_timeout_ms,
                DEFAULT_HEALTH_CHECK_TIMEOUT_MS,
                "healthCheckTimeoutMs",
            )?),
            sweep_interval: Duration::from_secs(positive(
                patch.sweep_interval_secs,
                DEFAULT_SWEEP_INTERVAL_SECS,
                "sweepIntervalSecs",
            )?),
        };

        Ok(Self {
            near_rpc_url,
            contract_id,
            relayer_url: patch.relayer_url.clone(),
            rp_id_override: patch.rp_id_override.clone(),
            near_explorer_url: patch.near_explorer_url.clone(),
            initial_account_balance: patch.initial_account_balance.clone(),
            pool,
            confirmation: patch
                .confirmation
                .as_ref()
                .map(ConfirmationPatch::resolve)
                .unwrap_or_default(),
        })
    }
}

/// Startup configuration: the env layer plus logging.
#[derive(Debug, Clone, Default)]
pub struct StartupConfig {
    pub base: HostConfigPatch,
    pub observability: ObservabilityConfig,
}

impl StartupConfig {
    /// Load `.env` (if present) and read the env layer.
    pub fn load() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Ok(Self {
            base: HostConfigPatch::from_env()?,
            observability: ObservabilityConfig::resolve()?,
        })
    }
}
