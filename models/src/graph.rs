//! The declared resource graph.
//!
//! Resources are identified by their type and logical name. A resource may only point at
//! resources declared before it, which keeps the graph acyclic without a separate check; the
//! topological order is still computed explicitly so the plan output does not depend on the
//! order in which continuations happened to declare resources.
use crate::engine::ResourceState;
use crate::output::Output;

use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt};

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

/// The kinds of resources this workspace declares. The display form is the type token handed to
/// the provisioning engine.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    /// A logical grouping of resources, identified by its `<package>:<module>:<type>` token.
    Component(String),
    IamRole,
    IamPolicy,
    IamInstanceProfile,
    IamOpenIdConnectProvider,
    EksCluster,
    EksNodeGroup,
    EksAddon,
    Ec2Tag,
    Ec2VpcEndpoint,
    SqsQueue,
    SqsQueuePolicy,
    EventRule,
    EventTarget,
    KubernetesServiceAccount,
}

impl ResourceKind {
    pub fn type_token(&self) -> &str {
        match self {
            ResourceKind::Component(token) => token,
            ResourceKind::IamRole => "aws:iam/role:Role",
            ResourceKind::IamPolicy => "aws:iam/policy:Policy",
            ResourceKind::IamInstanceProfile => "aws:iam/instanceProfile:InstanceProfile",
            ResourceKind::IamOpenIdConnectProvider => {
                "aws:iam/openIdConnectProvider:OpenIdConnectProvider"
            }
            ResourceKind::EksCluster => "aws:eks/cluster:Cluster",
            ResourceKind::EksNodeGroup => "aws:eks/nodeGroup:NodeGroup",
            ResourceKind::EksAddon => "aws:eks/addon:Addon",
            ResourceKind::Ec2Tag => "aws:ec2/tag:Tag",
            ResourceKind::Ec2VpcEndpoint => "aws:ec2/vpcEndpoint:VpcEndpoint",
            ResourceKind::SqsQueue => "aws:sqs/queue:Queue",
            ResourceKind::SqsQueuePolicy => "aws:sqs/queuePolicy:QueuePolicy",
            ResourceKind::EventRule => "aws:cloudwatch/eventRule:EventRule",
            ResourceKind::EventTarget => "aws:cloudwatch/eventTarget:EventTarget",
            ResourceKind::KubernetesServiceAccount => "kubernetes:core/v1:ServiceAccount",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_token())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    pub kind: ResourceKind,
    pub name: String,
}

impl ResourceId {
    pub fn new<S: Into<String>>(kind: ResourceKind, name: S) -> Self {
        ResourceId {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.kind, self.name)
    }
}

/// A declaration whose properties have all resolved, as handed to the provisioning engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResolvedDeclaration {
    pub id: ResourceId,
    pub parent: Option<ResourceId>,
    /// Every resource this one waited for: parent, explicit and property-derived dependencies.
    pub dependencies: BTreeSet<ResourceId>,
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl ResolvedDeclaration {
    pub fn property(&self, key: &str) -> Option<&serde_json::Value> {
        self.properties.get(key)
    }

    pub fn str_property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(|value| value.as_str())
    }
}

/// A created resource, as reported in the plan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedResource {
    #[serde(rename = "type")]
    pub type_token: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    pub properties: BTreeMap<String, serde_json::Value>,
    pub state: ResourceState,
}

pub(crate) struct Node {
    pub(crate) parent: Option<ResourceId>,
    pub(crate) dependencies: BTreeSet<ResourceId>,
    pub(crate) state: Output<ResourceState>,
    pub(crate) resolved: Option<(ResolvedDeclaration, ResourceState)>,
}

#[derive(Default)]
pub struct ResourceGraph {
    nodes: BTreeMap<ResourceId, Node>,
    /// Declaration order, used to break ties in the topological order.
    declared: Vec<ResourceId>,
}

impl ResourceGraph {
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.declared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.declared.is_empty()
    }

    pub(crate) fn insert(&mut self, id: ResourceId, node: Node) -> Result<()> {
        ensure!(
            !self.nodes.contains_key(&id),
            graph_error::DuplicateResourceSnafu { id: id.to_string() }
        );
        for dependency in node.parent.iter().chain(node.dependencies.iter()) {
            ensure!(
                self.nodes.contains_key(dependency),
                graph_error::UnknownDependencySnafu {
                    id: id.to_string(),
                    dependency: dependency.to_string(),
                }
            );
        }
        self.declared.push(id.clone());
        self.nodes.insert(id, node);
        Ok(())
    }

    pub(crate) fn state(&self, id: &ResourceId) -> Result<Output<ResourceState>> {
        self.nodes
            .get(id)
            .map(|node| node.state.clone())
            .context(graph_error::UnknownResourceSnafu { id: id.to_string() })
    }

    /// The creation futures of every resource declared after the first `index` declarations.
    pub(crate) fn states_since(&self, index: usize) -> Vec<(ResourceId, Output<ResourceState>)> {
        self.declared
            .iter()
            .skip(index)
            .map(|id| (id.clone(), self.nodes[id].state.clone()))
            .collect()
    }

    pub(crate) fn record(
        &mut self,
        declaration: ResolvedDeclaration,
        state: ResourceState,
    ) -> Result<()> {
        let node = self
            .nodes
            .get_mut(&declaration.id)
            .context(graph_error::UnknownResourceSnafu {
                id: declaration.id.to_string(),
            })?;
        node.resolved = Some((declaration, state));
        Ok(())
    }

    /// The resources `id` waits for.
    pub fn dependencies(&self, id: &ResourceId) -> Result<Vec<ResourceId>> {
        let node = self
            .nodes
            .get(id)
            .context(graph_error::UnknownResourceSnafu { id: id.to_string() })?;
        Ok(node
            .parent
            .iter()
            .chain(node.dependencies.iter())
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect())
    }

    /// Kahn's algorithm over the declared edges, preferring declaration order among ready nodes.
    pub fn topological_order(&self) -> Result<Vec<ResourceId>> {
        let position: BTreeMap<&ResourceId, usize> = self
            .declared
            .iter()
            .enumerate()
            .map(|(index, id)| (id, index))
            .collect();

        let mut remaining: BTreeMap<&ResourceId, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&ResourceId, Vec<&ResourceId>> = BTreeMap::new();
        for id in &self.declared {
            let node = &self.nodes[id];
            let upstream: BTreeSet<&ResourceId> =
                node.parent.iter().chain(node.dependencies.iter()).collect();
            remaining.insert(id, upstream.len());
            for dependency in upstream {
                dependents.entry(dependency).or_default().push(id);
            }
        }

        let mut ready: VecDeque<&ResourceId> = self
            .declared
            .iter()
            .filter(|id| remaining[id] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.declared.len());
        while let Some(id) = ready.pop_front() {
            order.push(id.clone());
            let mut unblocked = Vec::new();
            for dependent in dependents.get(id).into_iter().flatten() {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        unblocked.push(*dependent);
                    }
                }
            }
            unblocked.sort_by_key(|id| position[id]);
            ready.extend(unblocked);
        }

        ensure!(
            order.len() == self.declared.len(),
            graph_error::CycleSnafu {
                unresolved: self.declared.len() - order.len()
            }
        );
        Ok(order)
    }

    /// Every created resource in topological order. Resources that were not created are skipped.
    pub fn resolved_resources(&self) -> Result<Vec<ResolvedResource>> {
        Ok(self
            .topological_order()?
            .into_iter()
            .filter_map(|id| self.nodes[&id].resolved.as_ref())
            .map(|(declaration, state)| ResolvedResource {
                type_token: declaration.id.kind.type_token().to_string(),
                name: declaration.id.name.clone(),
                parent: declaration.parent.as_ref().map(ToString::to_string),
                depends_on: declaration
                    .dependencies
                    .iter()
                    .filter(|dependency| Some(*dependency) != declaration.parent.as_ref())
                    .map(ToString::to_string)
                    .collect(),
                properties: declaration.properties.clone(),
                state: state.clone(),
            })
            .collect())
    }

    /// The resolved declarations of one kind, in declaration order.
    pub fn declarations_of(&self, kind: &ResourceKind) -> Vec<ResolvedDeclaration> {
        self.declared
            .iter()
            .filter(|id| &id.kind == kind)
            .filter_map(|id| self.nodes[id].resolved.as_ref())
            .map(|(declaration, _)| declaration.clone())
            .collect()
    }

    pub fn declaration(&self, id: &ResourceId) -> Option<ResolvedDeclaration> {
        self.nodes
            .get(id)
            .and_then(|node| node.resolved.as_ref())
            .map(|(declaration, _)| declaration.clone())
    }
}

pub type Result<T> = std::result::Result<T, graph_error::Error>;

pub mod graph_error {
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

        #[snafu(display("Resource '{}' has not been declared", id))]
        UnknownResource { id: String },

        #[snafu(display("{} resources are part of a dependency cycle", unresolved))]
        Cycle { unresolved: usize },
    }
}
