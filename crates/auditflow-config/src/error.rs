// error.rs
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("secrets found in config but no fingerprint key available; set AUDITFLOW_FINGERPRINT_KEY or \
             AUDITFLOW_ALLOW_RAW_SECRETS=true. Offending fields: {fields:?}")]
    SecretFingerprint { fields: Vec<String> },

    #[error(transparent)]
    Engine(#[from] auditflow_core::EngineError),
}
