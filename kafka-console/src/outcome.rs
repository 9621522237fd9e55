//! A value that was either obtained or failed to be obtained, where the failure is itself data to be reported
//! rather than an error that aborts the surrounding operation.

use std::fmt;

#[derive(Debug)]
pub enum Outcome<T, E = anyhow::Error> {
    Value(T),
    Failure(E),
}

impl<T, E> Outcome<T, E> {
    pub fn is_value(&self) -> bool {
        matches!(self, Outcome::Value(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Value(value) => Some(value),
            Outcome::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&E> {
        match self {
            Outcome::Value(_) => None,
            Outcome::Failure(cause) => Some(cause),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U, E> {
        match self {
            Outcome::Value(value) => Outcome::Value(f(value)),
            Outcome::Failure(cause) => Outcome::Failure(cause),
        }
    }

    pub fn and_then<U>(self, f: impl FnOnce(T) -> Outcome<U, E>) -> Outcome<U, E> {
        match self {
            Outcome::Value(value) => f(value),
            Outcome::Failure(cause) => Outcome::Failure(cause),
        }
    }

    pub fn map_failure<F>(self, f: impl FnOnce(E) -> F) -> Outcome<T, F> {
        match self {
            Outcome::Value(value) => Outcome::Value(value),
            Outcome::Failure(cause) => Outcome::Failure(f(cause)),
        }
    }

    pub fn into_result(self) -> Result<T, E> {
        match self {
            Outcome::Value(value) => Ok(value),
            Outcome::Failure(cause) => Err(cause),
        }
    }
}

impl<T, E> From<Result<T, E>> for Outcome<T, E> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Outcome::Value(value),
            Err(cause) => Outcome::Failure(cause),
        }
    }
}

impl<T: fmt::Display, E: fmt::Display> fmt::Display for Outcome<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Value(value) => write!(f, "{value}"),
            Outcome::Failure(cause) => write!(f, "failed: {cause}"),
        }
    }
}
