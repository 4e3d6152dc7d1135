use thiserror::Error;

/// Errors raised while building a graph.
///
/// Numeric conditions (division by a zero-valued node, a negative base raised
/// to a fractional power, a NaN or infinite exponent) are not errors: they propagate as IEEE infinities
/// and NaNs through data and gradients alike.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Invalid argument to `{operation}`: {reason}")]
    InvalidArgument {
        operation: &'static str,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
