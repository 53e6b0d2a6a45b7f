use std::io;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    /// No candidate connected before `overall` elapsed.
    #[error("connection attempt timed out before any candidate succeeded")]
    Exhausted,

    /// Every candidate was tried and every one refused or errored.
    #[error("all {0} candidate(s) refused the connection")]
    AllRefused(usize),

    /// A single candidate's own `per_target` timeout fired.
    #[error("candidate connection timed out")]
    Timeout,

    #[error(transparent)]
    Io(#[from] io::Error),
}
