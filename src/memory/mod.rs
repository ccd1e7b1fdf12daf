use std::fmt;

pub(crate) mod buffer_pool;
pub(crate) mod manager;
pub(crate) mod small;
pub(crate) mod stats;
pub(crate) mod sys;

/// Errors from one-shot initialization and configuration surfaces.
/// The allocation hot path itself has no recoverable failures: success is a
/// non-null pointer, and an unhandled OS allocation failure is fatal.
#[derive(Debug, PartialEq, Eq)]
pub enum InitError {
    /// The global allocator was already initialized (explicitly or by a
    /// first allocation) when a configuration was supplied.
    AlreadyInitialized,
    /// A configuration field failed validation.
    InvalidConfig(String),
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::AlreadyInitialized => {
                write!(f, "global allocator already initialized")
            }
            InitError::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for InitError {}

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
