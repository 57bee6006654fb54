#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("invalid ID")]
    InvalidId,
    #[error("invalid name")]
    InvalidName,
    #[error("name is already registered: {name}")]
    NameTaken { name: String },
    #[error("invalid sample spec")]
    InvalidSampleSpec,
    #[error("channel count mismatch")]
    ChannelMismatch,
    #[error("sample specs do not match")]
    SpecMismatch,
    #[error("construction vetoed")]
    Vetoed,
    #[error("operation not legal in the current state")]
    InvalidState,
    #[error("cannot move a synchronized stream")]
    Synchronized,
    #[error("driver rejected the operation")]
    DriverFailure,
    #[error("io thread disconnected")]
    Disconnected,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
