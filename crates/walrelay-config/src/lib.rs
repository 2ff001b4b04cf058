mod error;
mod relay;
mod validation;

pub use error::{ConfigError, ConfigResult};
pub use relay::{
    resolve_env, DestinationConfig, GuardConfig, OriginConfig, RelayConfig, SessionConfig,
    DEFAULT_NAME,
};
pub use validation::validate_config;
