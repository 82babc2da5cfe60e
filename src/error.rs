use thiserror::Error;

/// Problems found while validating a plan or schedule. Always fatal to the run
/// and always raised before any virtual user is spawned.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("stage list is empty")]
    EmptyStages,

    #[error("schedule never reaches a non-zero number of virtual users")]
    ZeroUsers,

    #[error("stages add up to zero time, no virtual user would ever start")]
    ZeroDuration,

    #[error("iteration executor needs at least one vu and one iteration (vus={vus}, iterations={iterations})")]
    ZeroIterations { vus: u32, iterations: u64 },

    #[error("scenario has no steps")]
    EmptyScenario,

    #[error("scenario uses a login step but no login is configured")]
    MissingLogin,

    #[error("a login step keeps its session across iterations, set no_cookies_reset")]
    LoginNeedsCookies,

    #[error("user pool size must be greater than zero")]
    EmptyUserPool,

    #[error("invalid duration '{0}': use a number followed by ms, s, m or h")]
    InvalidDuration(String),

    #[error("invalid threshold '{expression}' on metric '{metric}': {reason}")]
    InvalidThreshold {
        metric: String,
        expression: String,
        reason: String,
    },

    #[error("invalid target url '{0}'")]
    InvalidTarget(String),

    #[error("could not read plan: {0}")]
    Plan(String),
}

/// Aborts the current iteration of one virtual user. The worker keeps running
/// and the next iteration starts from the top of the scenario.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum IterationError {
    #[error("login failed: {username}, status={status}, location={location}")]
    LoginFailed {
        username: String,
        status: u16,
        location: String,
    },
}

/// Transport level failure. Never escapes the transport: it is folded into a
/// `RequestRecord` with status 0 so checks fail naturally.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection refused or host unreachable")]
    Connect,

    #[error("Timeout")]
    Timeout,

    #[error("Connection closed unexpectedly")]
    Closed,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("too many redirects ({0})")]
    TooManyRedirects(usize),

    #[error("Unknown network error: {0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
