use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// The booking already carries the requested terminal status.
    AlreadyDecided(Ulid),
    /// Booker and owner are the same user.
    SameParty(Ulid),
    /// The item is not accepting booking requests.
    Unavailable(Ulid),
    Validation(&'static str),
    Pagination {
        from: i64,
        size: i64,
    },
    UnsupportedState(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::AlreadyDecided(id) => {
                write!(f, "booking {id} already carries the requested decision")
            }
            EngineError::SameParty(id) => {
                write!(f, "owner {id} cannot book their own item")
            }
            EngineError::Unavailable(id) => {
                write!(f, "item {id} is not available for booking")
            }
            EngineError::Validation(msg) => write!(f, "validation failed: {msg}"),
            EngineError::Pagination { from, size } => {
                write!(f, "invalid page: from={from} size={size}")
            }
            EngineError::UnsupportedState(s) => write!(f, "unknown state: {s}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
