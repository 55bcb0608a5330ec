//! Error types for vision-bridge

use crate::config::ConfigError;
use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, BridgeError>;

/// A value that cannot be converted between the Lua and native object models.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MarshalError {
    /// Functions, coroutines and foreign userdata have no native counterpart
    #[error("cannot marshal a Lua {0} value")]
    Unsupported(&'static str),

    #[error("table keys must be strings, found a {0} key")]
    NonStringKey(&'static str),

    /// Integer keys that do not form a `1..n` sequence
    #[error("table mixes sequence and mapping entries")]
    MixedTable,

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    /// Usually a table that contains itself
    #[error("value nesting exceeds {0} levels")]
    TooDeep(usize),

    #[error("expected a mapping, got a {0}")]
    ExpectedMap(&'static str),

    /// The Lua engine failed while the value was being read
    #[error("lua engine error while reading value: {0}")]
    Engine(String),
}

/// Main error type for vision-bridge
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Missing or malformed call arguments, unknown processor type
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A processing mode that is not compiled in or not supported here
    #[error("{0}")]
    UnavailableCapability(String),

    #[error("marshal error: {0}")]
    Marshal(#[from] MarshalError),

    /// The native plugin failed while being initialized or called
    #[error("frame processor plugin \"{plugin}\" failed: {message}")]
    NativeInvocation { plugin: String, message: String },

    /// The proxy was used after its owning platform context tore it down
    #[error("VisionCameraProxy has been destroyed")]
    ContextDestroyed,

    /// Worklet thread failures and errors thrown by worklet scripts
    #[error("worklet error: {0}")]
    Worklet(String),

    #[error("lua error: {0}")]
    Lua(#[from] mlua::Error),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

impl BridgeError {
    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Find the `BridgeError` a Rust callback raised somewhere inside an
    /// `mlua::Error` chain.
    pub fn find(err: &mlua::Error) -> Option<&BridgeError> {
        match err {
            mlua::Error::ExternalError(inner) => inner.downcast_ref::<BridgeError>(),
            mlua::Error::CallbackError { cause, .. } => Self::find(cause),
            _ => None,
        }
    }
}

impl From<BridgeError> for mlua::Error {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Lua(inner) => inner,
            other => mlua::Error::external(other),
        }
    }
}
