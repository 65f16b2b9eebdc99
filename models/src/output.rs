//! Deferred values.
//!
//! Most attributes of a declared resource (ARNs, the cluster issuer URL, security group ids) only
//! exist after the engine has created that resource. An [`Output`] is a shared, lazily polled
//! future over such a value, remembering which resources it was derived from so that consuming it
//! in another resource's properties creates a dependency edge.
//!
//! Failures travel through every combinator: a continuation never runs on a failed upstream, and
//! the failure surfaces wherever the output is finally resolved.
use crate::graph::ResourceId;

use futures::future::{self, BoxFuture, FutureExt, Shared};
use serde::Serialize;
use snafu::Snafu;

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;

pub type OutputResult<T> = std::result::Result<T, OutputError>;

/// Errors carried by deferred values. Outputs are shared between many consumers, so the error is
/// `Clone` and keeps rendered messages rather than the original error values.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub))]
pub enum OutputError {
    #[snafu(display("Assertion failed: {}", message))]
    Assertion { message: String },

    #[snafu(display("Resource '{}' could not be created: {}", resource, message))]
    Engine { resource: String, message: String },

    #[snafu(display(
        "Resource '{}' was not created because '{}' failed: {}",
        resource,
        dependency,
        message
    ))]
    DependencyFailed {
        resource: String,
        dependency: String,
        message: String,
    },

    #[snafu(display("Resource '{}' has no output named '{}'", resource, key))]
    MissingOutput { resource: String, key: String },

    #[snafu(display(
        "Output '{}' of resource '{}' has an unexpected shape: {}",
        key,
        resource,
        message
    ))]
    InvalidOutput {
        resource: String,
        key: String,
        message: String,
    },

    #[snafu(display("Unable to serialize value: {}", message))]
    Serialize { message: String },

    #[snafu(display("Unable to declare resources from a continuation: {}", message))]
    Registration { message: String },

    #[snafu(display("{} failed: {}", collaborator, message))]
    Collaborator {
        collaborator: String,
        message: String,
    },
}

impl OutputError {
    pub fn assertion<S: Into<String>>(message: S) -> Self {
        OutputError::Assertion {
            message: message.into(),
        }
    }

    pub fn collaborator<S, E>(collaborator: S, error: E) -> Self
    where
        S: Into<String>,
        E: fmt::Display,
    {
        OutputError::Collaborator {
            collaborator: collaborator.into(),
            message: error.to_string(),
        }
    }
}

/// A value that becomes available once the resources it depends on have been created.
pub struct Output<T> {
    value: Shared<BoxFuture<'static, OutputResult<T>>>,
    dependencies: BTreeSet<ResourceId>,
}

impl<T> Clone for Output<T>
where
    T: Clone,
{
    fn clone(&self) -> Self {
        Output {
            value: self.value.clone(),
            dependencies: self.dependencies.clone(),
        }
    }
}

impl<T> fmt::Debug for Output<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Output")
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

impl<T> Output<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// A value that is known while the program declares resources.
    pub fn known(value: T) -> Self {
        Self::from_future(future::ready(Ok(value)), BTreeSet::new())
    }

    /// A value that will never resolve successfully.
    pub fn failed(error: OutputError) -> Self {
        Self::from_future(future::ready(Err(error)), BTreeSet::new())
    }

    pub fn from_future<F>(value: F, dependencies: BTreeSet<ResourceId>) -> Self
    where
        F: Future<Output = OutputResult<T>> + Send + 'static,
    {
        Output {
            value: value.boxed().shared(),
            dependencies,
        }
    }

    /// The resources this value is derived from.
    pub fn dependencies(&self) -> &BTreeSet<ResourceId> {
        &self.dependencies
    }

    pub async fn resolve(&self) -> OutputResult<T> {
        self.value.clone().await
    }

    /// Registers an asynchronous continuation that runs once this value resolves.
    pub fn apply<U, F, Fut>(&self, continuation: F) -> Output<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = OutputResult<U>> + Send + 'static,
    {
        let upstream = self.value.clone();
        Output::from_future(
            async move {
                let value = upstream.await?;
                continuation(value).await
            },
            self.dependencies.clone(),
        )
    }

    pub fn map<U, F>(&self, transform: F) -> Output<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.apply(move |value| future::ready(Ok(transform(value))))
    }

    pub fn try_map<U, F>(&self, transform: F) -> Output<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> OutputResult<U> + Send + 'static,
    {
        self.apply(move |value| future::ready(transform(value)))
    }

    /// Combines two values, depending on the resources behind both.
    pub fn zip<U>(&self, other: &Output<U>) -> Output<(T, U)>
    where
        U: Clone + Send + Sync + 'static,
    {
        let left = self.value.clone();
        let right = other.value.clone();
        let dependencies = self
            .dependencies
            .union(&other.dependencies)
            .cloned()
            .collect();
        Output::from_future(
            async move { future::try_join(left, right).await },
            dependencies,
        )
    }

    pub fn all<I>(outputs: I) -> Output<Vec<T>>
    where
        I: IntoIterator<Item = Output<T>>,
    {
        let outputs: Vec<Output<T>> = outputs.into_iter().collect();
        let dependencies = outputs
            .iter()
            .flat_map(|output| output.dependencies.iter().cloned())
            .collect();
        let values: Vec<_> = outputs.into_iter().map(|output| output.value).collect();
        Output::from_future(
            async move { future::try_join_all(values).await },
            dependencies,
        )
    }

    /// Adds an ordering dependency without changing the value.
    pub fn with_dependency(mut self, resource: ResourceId) -> Self {
        self.dependencies.insert(resource);
        self
    }
}

impl<T> Output<T>
where
    T: Clone + Serialize + Send + Sync + 'static,
{
    pub fn to_value(&self) -> Output<serde_json::Value> {
        self.try_map(|value| {
            serde_json::to_value(value).map_err(|e| OutputError::Serialize {
                message: e.to_string(),
            })
        })
    }
}

impl<T> From<T> for Output<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn from(value: T) -> Self {
        Output::known(value)
    }
}

impl From<&str> for Output<String> {
    fn from(value: &str) -> Self {
        Output::known(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceKind;

    #[tokio::test]
    async fn test_map_and_zip_resolve() {
        let name = Output::known("principal".to_string());
        let version = Output::known(27);
        let combined = name
            .map(|name| format!("{}-cluster", name))
            .zip(&version)
            .map(|(name, version)| format!("{}:1.{}", name, version));

        assert_eq!(combined.resolve().await.unwrap(), "principal-cluster:1.27");
    }

    #[tokio::test]
    async fn test_failure_propagates_through_continuations() {
        let failed: Output<String> = Output::failed(OutputError::assertion("IssuerUrl is empty"));
        let downstream = failed
            .map(|issuer| issuer.len())
            .apply(|length| async move { Ok(length * 2) });

        assert_eq!(
            downstream.resolve().await,
            Err(OutputError::assertion("IssuerUrl is empty"))
        );
    }

    #[tokio::test]
    async fn test_continuation_runs_once_for_many_consumers() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let thumbprint = Output::known("cluster".to_string()).apply(move |name| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{}-thumbprint", name))
        });

        let first = thumbprint.clone();
        let second = thumbprint.map(|value| value.to_uppercase());
        assert_eq!(first.resolve().await.unwrap(), "cluster-thumbprint");
        assert_eq!(second.resolve().await.unwrap(), "CLUSTER-THUMBPRINT");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dependencies_are_merged() {
        let role = ResourceId::new(ResourceKind::IamRole, "role");
        let queue = ResourceId::new(ResourceKind::SqsQueue, "queue");
        let arn = Output::known("arn".to_string()).with_dependency(role.clone());
        let url = Output::known("url".to_string()).with_dependency(queue.clone());

        let all = Output::all(vec![arn.clone(), url]);
        assert_eq!(
            all.dependencies().iter().cloned().collect::<Vec<_>>(),
            vec![role.clone(), queue]
        );
        assert_eq!(all.resolve().await.unwrap(), vec!["arn", "url"]);
        assert_eq!(arn.map(|a| a.len()).dependencies().len(), 1);
    }
}
