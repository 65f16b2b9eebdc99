use std::fmt::{Display, Formatter};

/// A failure of an external collaborator: a helper script, an AWS API call or a file read.
#[derive(Debug)]
pub struct CollaboratorError {
    /// What the collaborator was doing. Displayed before `inner`.
    context: Option<String>,
    /// The error that caused this error.
    inner: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

pub type CollaboratorResult<T> = std::result::Result<T, CollaboratorError>;

impl CollaboratorError {
    pub fn new_with_source_and_context<S, E>(context: S, source: E) -> Self
    where
        S: Into<String>,
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        Self {
            context: Some(context.into()),
            inner: Some(source.into()),
        }
    }

    pub fn new_with_context<S>(context: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            context: Some(context.into()),
            inner: None,
        }
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    pub fn inner(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.inner.as_ref().map(|some| some.as_ref())
    }
}

impl Display for CollaboratorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match (self.context(), self.inner()) {
            (Some(context), Some(inner)) => write!(f, "{}: {}", context, inner),
            (Some(context), None) => write!(f, "{}", context),
            (None, Some(inner)) => write!(f, "{}", inner),
            (None, None) => write!(f, "unknown collaborator failure"),
        }
    }
}

impl std::error::Error for CollaboratorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Converts errors and empty options to `CollaboratorError` with a familiar `context` function.
pub trait IntoCollaboratorError<T> {
    fn context<S>(self, message: S) -> CollaboratorResult<T>
    where
        S: Into<String>;
}

impl<T, E> IntoCollaboratorError<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context<S>(self, message: S) -> CollaboratorResult<T>
    where
        S: Into<String>,
    {
        self.map_err(|e| CollaboratorError::new_with_source_and_context(message, e))
    }
}

impl<T> IntoCollaboratorError<T> for std::option::Option<T> {
    fn context<S>(self, message: S) -> CollaboratorResult<T>
    where
        S: Into<String>,
    {
        self.ok_or_else(|| CollaboratorError::new_with_context(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_joins_context_and_source() {
        let error: CollaboratorResult<u32> = "forty".parse::<u32>().context("Unable to read size");
        assert_eq!(
            error.unwrap_err().to_string(),
            "Unable to read size: invalid digit found in string"
        );

        let missing: CollaboratorResult<u32> = None.context("Cluster has no endpoint");
        assert_eq!(missing.unwrap_err().to_string(), "Cluster has no endpoint");
    }
}
