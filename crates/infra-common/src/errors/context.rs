use crate::errors::types::{Error, Result};
use std::fmt;

/// Where an error happened: the component and the operation it was running
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    pub component: String,
    pub operation: String,
    pub details: Option<String>,
}

impl ErrorContext {
    pub fn new<S: Into<String>, T: Into<String>>(component: S, operation: T) -> Self {
        ErrorContext {
            component: component.into(),
            operation: operation.into(),
            details: None,
        }
    }

    pub fn with_details<S: Into<String>>(mut self, details: S) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "in component '{}' during operation '{}'", self.component, self.operation)?;
        if let Some(details) = &self.details {
            write!(f, " ({})", details)?;
        }
        Ok(())
    }
}

/// Attach an [`ErrorContext`] to an error or to the error side of a result
pub trait ErrorExt {
    type Output;

    fn context(self, ctx: ErrorContext) -> Self::Output;

    fn with_context<S: Into<String>, T: Into<String>>(self, component: S, operation: T) -> Self::Output
    where
        Self: Sized,
    {
        self.context(ErrorContext::new(component, operation))
    }
}

impl ErrorExt for Error {
    type Output = Error;

    fn context(self, ctx: ErrorContext) -> Error {
        // Keep the variant so callers can still match on the kind
        match self {
            Error::Config(msg) => Error::Config(format!("{} [{}]", msg, ctx)),
            Error::Custom(msg) => Error::Custom(format!("{} [{}]", msg, ctx)),
            Error::Internal(msg) => Error::Internal(format!("{} [{}]", msg, ctx)),
        }
    }
}

impl<T> ErrorExt for Result<T> {
    type Output = Result<T>;

    fn context(self, ctx: ErrorContext) -> Result<T> {
        self.map_err(|e| e.context(ctx))
    }
}
