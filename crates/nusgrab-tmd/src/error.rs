use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TmdError {
    #[error("title metadata failed verification")]
    Invalid,

    #[error("title metadata repair failed")]
    RepairFailed,

    #[error("title metadata truncated: {len} bytes")]
    Truncated { len: usize },
}
