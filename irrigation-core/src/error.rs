use thiserror::Error;

use crate::provider::ProviderId;

/// Failure taxonomy of the advisory core.
///
/// None of these are process-fatal: each one maps to a documented fallback
/// tier at the call site.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// A single provider call failed (transport, status, decoding or timeout).
    /// Excluded from aggregation; never aborts a batch.
    #[error("provider '{provider}' unavailable: {reason}")]
    ProviderUnavailable { provider: ProviderId, reason: String },

    /// The polygon could not be sampled at all.
    #[error("polygon produced no usable sample points")]
    InsufficientSamples,

    /// Every sample failed; the caller has to fall back.
    #[error("no weather data available: all {attempted} samples failed")]
    NoDataAvailable { attempted: usize },

    /// A formula was evaluated without one of its required inputs.
    #[error("missing input '{0}'")]
    MissingInput(&'static str),

    #[error("device '{device_id}' is offline")]
    DeviceOffline { device_id: String },

    #[error("invalid polygon: {0}")]
    InvalidPolygon(String),

    #[error("zone '{0}' not found")]
    ZoneNotFound(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub(crate) fn unavailable(provider: ProviderId, err: impl std::fmt::Display) -> Self {
        CoreError::ProviderUnavailable { provider, reason: err.to_string() }
    }
}
