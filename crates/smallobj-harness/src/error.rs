use thiserror::Error;

use smallobj_core::PoolError;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("pool: {0}")]
    Pool(#[from] PoolError),
    #[error("invariant violated at step {step}: {detail}")]
    InvariantViolated { step: usize, detail: String },
    #[error("unknown scenario '{0}', expected burst|reuse|realloc|pressure")]
    UnknownScenario(String),
    #[error("invalid seed '{0}'")]
    InvalidSeed(String),
}

impl HarnessError {
    pub(crate) fn violated(step: usize, detail: impl Into<String>) -> Self {
        Self::InvariantViolated {
            step,
            detail: detail.into(),
        }
    }
}

/// Parses a seed given as decimal or `0x` hex, with optional `_` separators.
pub fn parse_seed(raw: &str) -> Result<u64, HarnessError> {
    let s = raw.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(&hex.replace('_', ""), 16)
    } else {
        s.replace('_', "").parse::<u64>()
    };
    parsed.map_err(|_| HarnessError::InvalidSeed(raw.to_string()))
}
