//! The composition context.
//!
//! A `Stack` collects resource declarations into a [`ResourceGraph`] and, on [`Stack::apply`],
//! drives every declaration through the provisioning engine. Declaring a resource never blocks:
//! it returns a [`Resource`] whose attributes are [`Output`]s, and the creation itself runs once
//! the resource's parent, its explicit dependencies and every resource its properties were derived
//! from have been created.
use crate::engine::{ProvisioningEngine, ResourceState};
use crate::graph::{
    graph_error, Node, ResolvedDeclaration, ResolvedResource, ResourceGraph, ResourceId,
    ResourceKind,
};
use crate::output::{Output, OutputError, OutputResult};

use futures::future::{self, join_all};
use serde::Serialize;
use serde_json::Value;
use snafu::{ensure, ResultExt};
use tracing::{event, instrument, Level};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// The properties of a declaration. Values may be known up front or derived from other resources.
#[derive(Clone, Debug, Default)]
pub struct ResourceArgs {
    properties: BTreeMap<String, Output<Value>>,
}

impl ResourceArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a property to a value known at declaration time.
    pub fn set<K, T>(mut self, key: K, value: T) -> Self
    where
        K: Into<String>,
        T: Serialize,
    {
        let value = match serde_json::to_value(value) {
            Ok(value) => Output::known(value),
            Err(e) => Output::failed(OutputError::Serialize {
                message: e.to_string(),
            }),
        };
        self.properties.insert(key.into(), value);
        self
    }

    /// Sets a property to a deferred value. The resources behind it become dependencies.
    pub fn set_output<K, T>(mut self, key: K, value: &Output<T>) -> Self
    where
        K: Into<String>,
        T: Clone + Serialize + Send + Sync + 'static,
    {
        self.properties.insert(key.into(), value.to_value());
        self
    }

    fn dependencies(&self) -> BTreeSet<ResourceId> {
        self.properties
            .values()
            .flat_map(|value| value.dependencies().iter().cloned())
            .collect()
    }
}

#[derive(Clone, Debug, Default)]
pub struct ResourceOptions {
    parent: Option<ResourceId>,
    depends_on: BTreeSet<ResourceId>,
}

impl ResourceOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parent(mut self, parent: &Resource) -> Self {
        self.parent = Some(parent.id().clone());
        self
    }

    pub fn depends_on(mut self, resource: &Resource) -> Self {
        self.depends_on.insert(resource.id().clone());
        self
    }

    pub fn depends_on_all<'a, I>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = &'a Resource>,
    {
        self.depends_on
            .extend(resources.into_iter().map(|resource| resource.id().clone()));
        self
    }
}

/// A handle to a declared resource.
#[derive(Clone, Debug)]
pub struct Resource {
    id: ResourceId,
    state: Output<ResourceState>,
}

impl Resource {
    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    pub fn state(&self) -> &Output<ResourceState> {
        &self.state
    }

    /// The physical identifier assigned by the engine.
    pub fn physical_id(&self) -> Output<String> {
        self.state.map(|state| state.id)
    }

    /// An output attribute reported by the engine.
    pub fn output(&self, key: &str) -> Output<Value> {
        let resource = self.id.to_string();
        let key = key.to_string();
        self.state.try_map(move |mut state| {
            state
                .outputs
                .remove(&key)
                .ok_or(OutputError::MissingOutput { resource, key })
        })
    }

    pub fn string_output(&self, key: &str) -> Output<String> {
        let resource = self.id.to_string();
        let key = key.to_string();
        self.output(&key).try_map(move |value| match value {
            Value::String(value) => Ok(value),
            other => Err(OutputError::InvalidOutput {
                resource,
                key,
                message: format!("expected a string, found '{}'", other),
            }),
        })
    }

    pub fn arn(&self) -> Output<String> {
        self.string_output("arn")
    }

    pub fn name(&self) -> Output<String> {
        self.string_output("name")
    }
}

/// The result of applying a stack.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StackOutputs {
    pub exports: BTreeMap<String, Value>,
    /// Created resources in topological order.
    pub resources: Vec<ResolvedResource>,
}

struct StackInner {
    engine: Arc<dyn ProvisioningEngine>,
    graph: Mutex<ResourceGraph>,
    tracked: Mutex<Vec<(String, Output<()>)>>,
    exports: Mutex<BTreeMap<String, Output<Value>>>,
}

#[derive(Clone)]
pub struct Stack {
    inner: Arc<StackInner>,
}

impl Stack {
    pub fn new(engine: Arc<dyn ProvisioningEngine>) -> Self {
        Stack {
            inner: Arc::new(StackInner {
                engine,
                graph: Mutex::new(ResourceGraph::default()),
                tracked: Mutex::new(Vec::new()),
                exports: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Declares a resource.
    ///
    /// Fails when `(kind, name)` is already declared or when the parent, an explicit dependency or
    /// a resource behind one of the properties has not been declared.
    pub fn register<S: Into<String>>(
        &self,
        kind: ResourceKind,
        name: S,
        args: ResourceArgs,
        options: ResourceOptions,
    ) -> Result<Resource> {
        let id = ResourceId::new(kind, name);
        let mut dependencies = options.depends_on;
        dependencies.extend(args.dependencies());
        if let Some(parent) = &options.parent {
            dependencies.remove(parent);
        }

        let mut graph = lock(&self.inner.graph)?;
        ensure!(
            !graph.contains(&id),
            stack_error::DuplicateResourceSnafu { id: id.to_string() }
        );
        let mut upstream = Vec::new();
        for dependency in options.parent.iter().chain(dependencies.iter()) {
            ensure!(
                graph.contains(dependency),
                stack_error::UnknownDependencySnafu {
                    id: id.to_string(),
                    dependency: dependency.to_string(),
                }
            );
            let state = graph.state(dependency).context(stack_error::GraphSnafu)?;
            upstream.push((dependency.clone(), state));
        }

        let state = Output::from_future(
            create(
                Arc::downgrade(&self.inner),
                id.clone(),
                options.parent.clone(),
                dependencies.clone(),
                upstream,
                args,
            ),
            std::iter::once(id.clone()).collect(),
        );
        graph
            .insert(
                id.clone(),
                Node {
                    parent: options.parent,
                    dependencies,
                    state: state.clone(),
                    resolved: None,
                },
            )
            .context(stack_error::GraphSnafu)?;
        event!(Level::DEBUG, resource = %id, "Declared resource.");

        Ok(Resource { id, state })
    }

    /// Declares a logical grouping resource. `token` is its `<package>:<module>:<type>` token.
    pub fn register_component<S: Into<String>>(
        &self,
        token: &str,
        name: S,
        options: ResourceOptions,
    ) -> Result<Resource> {
        self.register(
            ResourceKind::Component(token.to_string()),
            name,
            ResourceArgs::new(),
            options,
        )
    }

    /// Makes `apply` wait for a continuation that produces no resource of its own.
    pub fn track<S: Into<String>>(&self, description: S, task: Output<()>) -> Result<()> {
        lock(&self.inner.tracked)?.push((description.into(), task));
        Ok(())
    }

    /// Records a stack output.
    pub fn export<K, T>(&self, key: K, value: &Output<T>) -> Result<()>
    where
        K: Into<String>,
        T: Clone + Serialize + Send + Sync + 'static,
    {
        let key = key.into();
        let mut exports = lock(&self.inner.exports)?;
        ensure!(
            !exports.contains_key(&key),
            stack_error::DuplicateExportSnafu { key }
        );
        exports.insert(key, value.to_value());
        Ok(())
    }

    pub fn topological_order(&self) -> Result<Vec<ResourceId>> {
        lock(&self.inner.graph)?
            .topological_order()
            .context(stack_error::GraphSnafu)
    }

    /// The resources `id` waits for.
    pub fn dependencies_of(&self, id: &ResourceId) -> Result<Vec<ResourceId>> {
        lock(&self.inner.graph)?
            .dependencies(id)
            .context(stack_error::GraphSnafu)
    }

    /// Created declarations of one kind, in declaration order.
    pub fn declarations_of(&self, kind: &ResourceKind) -> Result<Vec<ResolvedDeclaration>> {
        Ok(lock(&self.inner.graph)?.declarations_of(kind))
    }

    pub fn declaration(&self, id: &ResourceId) -> Result<Option<ResolvedDeclaration>> {
        Ok(lock(&self.inner.graph)?.declaration(id))
    }

    /// Drives every declaration to completion.
    ///
    /// Continuations may declare further resources while they run, so declarations are collected
    /// in rounds until a round declares nothing new. Every failure is collected; the stack only
    /// succeeds when all resources, tracked continuations and exports resolved.
    #[instrument(skip(self))]
    pub async fn apply(&self) -> Result<StackOutputs> {
        let mut failures = Vec::new();
        let mut driven_resources = 0;
        let mut driven_tasks = 0;

        loop {
            let (resources, tasks) = {
                let graph = lock(&self.inner.graph)?;
                let tracked = lock(&self.inner.tracked)?;
                (
                    graph.states_since(driven_resources),
                    tracked[driven_tasks..].to_vec(),
                )
            };
            if resources.is_empty() && tasks.is_empty() {
                break;
            }
            driven_resources += resources.len();
            driven_tasks += tasks.len();
            event!(
                Level::INFO,
                resources = resources.len(),
                continuations = tasks.len(),
                "Applying declarations."
            );

            let resource_results = join_all(
                resources
                    .iter()
                    .map(|(id, state)| async move { (id.to_string(), state.resolve().await) }),
            );
            let task_results = join_all(
                tasks
                    .iter()
                    .map(|(name, task)| async move { (name.clone(), task.resolve().await) }),
            );
            let (resource_results, task_results) =
                future::join(resource_results, task_results).await;

            for (name, result) in resource_results {
                record_failure(&mut failures, &name, result.map(|_| ()));
            }
            for (name, result) in task_results {
                record_failure(&mut failures, &name, result);
            }
        }

        let pending_exports: Vec<(String, Output<Value>)> = lock(&self.inner.exports)?
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let mut exports = BTreeMap::new();
        for (key, value) in pending_exports {
            match value.resolve().await {
                Ok(value) => {
                    exports.insert(key, value);
                }
                Err(e) => record_failure(&mut failures, &format!("export '{}'", key), Err(e)),
            }
        }

        ensure!(
            failures.is_empty(),
            stack_error::ApplyFailedSnafu { failures }
        );

        let resources = lock(&self.inner.graph)?
            .resolved_resources()
            .context(stack_error::GraphSnafu)?;
        event!(
            Level::INFO,
            resources = resources.len(),
            exports = exports.len(),
            "Stack applied."
        );
        Ok(StackOutputs { exports, resources })
    }
}

fn record_failure(failures: &mut Vec<OutputError>, name: &str, result: OutputResult<()>) {
    if let Err(e) = result {
        // Dependents of a failed resource are reported at debug level; the root cause is an error.
        match e {
            OutputError::DependencyFailed { .. } => {
                event!(Level::DEBUG, name, error = %e, "Skipped declaration.")
            }
            _ => event!(Level::ERROR, name, error = %e, "Declaration failed."),
        }
        failures.push(e);
    }
}

async fn create(
    stack: Weak<StackInner>,
    id: ResourceId,
    parent: Option<ResourceId>,
    dependencies: BTreeSet<ResourceId>,
    upstream: Vec<(ResourceId, Output<ResourceState>)>,
    args: ResourceArgs,
) -> OutputResult<ResourceState> {
    let waits = upstream.iter().map(|(dependency, state)| {
        let resource = id.to_string();
        async move {
            state
                .resolve()
                .await
                .map(|_| ())
                .map_err(|e| OutputError::DependencyFailed {
                    resource,
                    dependency: dependency.to_string(),
                    message: e.to_string(),
                })
        }
    });
    future::try_join_all(waits).await?;

    let mut properties = BTreeMap::new();
    for (key, value) in args.properties {
        properties.insert(key, value.resolve().await?);
    }

    let declaration = ResolvedDeclaration {
        id: id.clone(),
        parent,
        dependencies,
        properties,
    };
    let inner = stack.upgrade().ok_or_else(|| OutputError::Registration {
        message: format!("the stack declaring '{}' no longer exists", id),
    })?;
    let state = inner
        .engine
        .create(&declaration)
        .await
        .map_err(|e| OutputError::Engine {
            resource: id.to_string(),
            message: e.to_string(),
        })?;
    event!(Level::INFO, resource = %id, physical_id = %state.id, "Created resource.");

    lock(&inner.graph)
        .map_err(|e| OutputError::Registration {
            message: e.to_string(),
        })?
        .record(declaration, state.clone())
        .map_err(|e| OutputError::Registration {
            message: e.to_string(),
        })?;
    Ok(state)
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| stack_error::Error::Poisoned)
}

/// Adapts a declaration failure inside a continuation to the error carried by outputs.
impl From<stack_error::Error> for OutputError {
    fn from(e: stack_error::Error) -> Self {
        OutputError::Registration {
            message: e.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, stack_error::Error>;

pub mod stack_error {
    use super::*;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Resource '{}' is declared twice", id))]
        DuplicateResource { id: String },

        #[snafu(display(
            "Resource '{}' depends on '{}', which has not been declared",
            id,
            dependency
        ))]
        UnknownDependency { id: String, dependency: String },

        #[snafu(display("Output '{}' is exported twice", key))]
        DuplicateExport { key: String },

        #[snafu(display("Resource graph error: {}", source))]
        Graph { source: graph_error::Error },

        #[snafu(display("A lock on the stack was poisoned"))]
        Poisoned,

        #[snafu(display(
            "Applying the stack failed with {} error(s): {}",
            failures.len(),
            failures.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
        ))]
        ApplyFailed { failures: Vec<OutputError> },
    }

    impl Error {
        /// The failures that are not merely a consequence of another failure.
        pub fn root_causes(&self) -> Vec<&OutputError> {
            match self {
                Error::ApplyFailed { failures } => failures
                    .iter()
                    .filter(|e| !matches!(e, OutputError::DependencyFailed { .. }))
                    .collect(),
                _ => Vec::new(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{engine_error, MockProvisioningEngine, PreviewEngine};
    use serde_json::json;

    fn preview_stack() -> Stack {
        Stack::new(Arc::new(PreviewEngine::new("123456789012", "us-west-2")))
    }

    #[tokio::test]
    async fn test_property_outputs_become_dependencies() {
        let stack = preview_stack();
        let role = stack
            .register(
                ResourceKind::IamRole,
                "cluster-role",
                ResourceArgs::new().set("name", "cluster-role"),
                ResourceOptions::new(),
            )
            .unwrap();
        let cluster = stack
            .register(
                ResourceKind::EksCluster,
                "cluster",
                ResourceArgs::new()
                    .set("name", "principal-cluster")
                    .set_output("roleArn", &role.arn()),
                ResourceOptions::new(),
            )
            .unwrap();

        assert_eq!(
            stack.dependencies_of(cluster.id()).unwrap(),
            vec![role.id().clone()]
        );

        let outputs = stack.apply().await.unwrap();
        assert_eq!(outputs.resources.len(), 2);
        assert_eq!(outputs.resources[0].name, "cluster-role");
        assert_eq!(
            outputs.resources[1].properties["roleArn"],
            json!("arn:aws:iam::123456789012:role/cluster-role")
        );
    }

    #[tokio::test]
    async fn test_registration_errors() {
        let stack = preview_stack();
        let orphan = Resource {
            id: ResourceId::new(ResourceKind::IamRole, "missing"),
            state: Output::known(ResourceState::default()),
        };
        stack
            .register(
                ResourceKind::SqsQueue,
                "queue",
                ResourceArgs::new(),
                ResourceOptions::new(),
            )
            .unwrap();

        assert!(matches!(
            stack.register(
                ResourceKind::SqsQueue,
                "queue",
                ResourceArgs::new(),
                ResourceOptions::new()
            ),
            Err(stack_error::Error::DuplicateResource { .. })
        ));
        assert!(matches!(
            stack.register(
                ResourceKind::SqsQueuePolicy,
                "queue-policy",
                ResourceArgs::new(),
                ResourceOptions::new().depends_on(&orphan)
            ),
            Err(stack_error::Error::UnknownDependency { .. })
        ));
    }

    #[tokio::test]
    async fn test_continuations_may_declare_resources() {
        let stack = preview_stack();
        let queue = stack
            .register(
                ResourceKind::SqsQueue,
                "queue",
                ResourceArgs::new().set("name", "demo"),
                ResourceOptions::new(),
            )
            .unwrap();
        let declaring = stack.clone();
        let rules = queue.arn().apply(move |arn| async move {
            for name in &["first", "second"] {
                declaring.register(
                    ResourceKind::EventRule,
                    *name,
                    ResourceArgs::new().set("description", &arn),
                    ResourceOptions::new(),
                )?;
            }
            Ok::<(), OutputError>(())
        });
        stack.track("declare rules", rules).unwrap();
        stack.export("QueueArn", &queue.arn()).unwrap();

        let outputs = stack.apply().await.unwrap();
        assert_eq!(outputs.resources.len(), 3);
        assert_eq!(
            outputs.exports["QueueArn"],
            json!("arn:aws:sqs:us-west-2:123456789012:demo")
        );
    }

    #[tokio::test]
    async fn test_engine_failure_fails_dependents() {
        let mut engine = MockProvisioningEngine::new();
        engine.expect_create().returning(|declaration| {
            if declaration.id.kind == ResourceKind::IamRole {
                engine_error::RejectedSnafu {
                    resource: declaration.id.to_string(),
                    message: "access denied",
                }
                .fail()
            } else {
                Ok(ResourceState::new(&declaration.id.name))
            }
        });
        let stack = Stack::new(Arc::new(engine));
        let role = stack
            .register(
                ResourceKind::IamRole,
                "role",
                ResourceArgs::new(),
                ResourceOptions::new(),
            )
            .unwrap();
        stack
            .register(
                ResourceKind::EksCluster,
                "cluster",
                ResourceArgs::new(),
                ResourceOptions::new().depends_on(&role),
            )
            .unwrap();

        let error = stack.apply().await.unwrap_err();
        match &error {
            stack_error::Error::ApplyFailed { failures } => {
                assert_eq!(failures.len(), 2);
                assert!(failures.iter().any(|failure| matches!(
                    failure,
                    OutputError::DependencyFailed { dependency, .. } if dependency.ends_with("::role")
                )));
            }
            other => panic!("unexpected error {}", other),
        }
        assert_eq!(error.root_causes().len(), 1);
    }
}
