use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("horizon must contain at least one step")]
    EmptyHorizon,
    #[error("time step {0} s is outside (0, {1}] s")]
    InvalidTimeStep(f64, f64),
    #[error("weight `{name}` must be finite and non-negative, got {value}")]
    InvalidWeight { name: &'static str, value: f64 },
    #[error("bound `{name}` is invalid: {reason}")]
    InvalidBound {
        name: &'static str,
        reason: &'static str,
    },
    #[error("parameter `{name}` must be finite and positive, got {value}")]
    InvalidParameter { name: &'static str, value: f64 },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Error, Debug)]
pub enum MpcError {
    #[error("invalid controller configuration: {0}")]
    Config(#[from] ConfigError),
}
