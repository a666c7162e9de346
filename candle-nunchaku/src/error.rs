//! Error type shared by every module of the crate.

/// Errors raised by the quantized Flux core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A shape, dtype, rank or residency contract was violated. These are
    /// programming errors on the caller side and are never retried.
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// A device, kernel or transfer operation failed.
    #[error("{op} failed: {source}")]
    Runtime {
        op: &'static str,
        #[source]
        source: candle::Error,
    },

    /// Unknown attention selector or an invalid model configuration.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::Precondition(_))
    }
}

impl From<candle::Error> for Error {
    fn from(source: candle::Error) -> Self {
        Self::Runtime { op: "tensor", source }
    }
}

/// Tags a candle result with the name of the operation that produced it.
pub trait OpContext<T> {
    fn op(self, op: &'static str) -> Result<T>;
}

impl<T> OpContext<T> for candle::Result<T> {
    fn op(self, op: &'static str) -> Result<T> {
        self.map_err(|source| Error::Runtime { op, source })
    }
}

/// Returns early with [`Error::Precondition`] when the condition does not hold.
#[macro_export]
macro_rules! precondition {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::Error::Precondition(format!($($arg)+)));
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(len: usize) -> Result<usize> {
        precondition!(len % 2 == 0, "length {len} must be even");
        Ok(len / 2)
    }

    #[test]
    fn precondition_macro_short_circuits() {
        assert_eq!(check(4).ok(), Some(2));
        let err = check(3).unwrap_err();
        assert!(err.is_precondition());
        assert_eq!(err.to_string(), "precondition violated: length 3 must be even");
    }

    #[test]
    fn candle_errors_are_tagged() {
        let err: Error = candle::Error::Msg("boom".to_string()).into();
        assert!(matches!(err, Error::Runtime { op: "tensor", .. }));
        let tagged = Err::<(), _>(candle::Error::Msg("boom".to_string())).op("mha_fwd");
        assert!(tagged.unwrap_err().to_string().starts_with("mha_fwd failed"));
    }
}
