use crate::engine::EngineError;

/// Failure of a request handler.
///
/// The kind decides how the failure reaches the client, see
/// [`crate::session::DebugSession`] response building.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- user visible errors ---------------------------------------
    /// Misuse or runtime failure the developer should see; echoed to the debug console.
    #[error("{0}")]
    User(String),
    /// Same as [`Error::User`] but never echoed to the console (watch and hover evaluation).
    #[error("{0}")]
    UserQuiet(String),
    #[error(transparent)]
    Engine(#[from] EngineError),

    // --------------------------------- protocol errors -------------------------------------------
    #[error("{0}")]
    Protocol(String),
    #[error("invalid arguments: {0}")]
    Arguments(#[from] serde_json::Error),

    // --------------------------------- internal errors -------------------------------------------
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// How an [`Error`] is turned into an error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    User { echo: bool },
    Protocol,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::User(_) | Error::Engine(_) => ErrorKind::User { echo: true },
            Error::UserQuiet(_) => ErrorKind::User { echo: false },
            Error::Protocol(_) | Error::Arguments(_) => ErrorKind::Protocol,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn user(msg: impl Into<String>) -> Self {
        Error::User(msg.into())
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "session", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "session", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
