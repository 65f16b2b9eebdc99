//! Typed IAM policy documents.
//!
//! Documents are built from [`Statement`]s and rendered to the JSON string the IAM APIs expect. No
//! attempt is made to validate the IAM grammar beyond what the types enforce.
use crate::constants::IAM_POLICY_VERSION;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use std::collections::BTreeMap;

mod documents;
pub mod karpenter;
pub mod trust;

pub use documents::{cluster_autoscaler_policy, load_balancer_controller_policies};

/// A value IAM accepts either as a single string or as a list of strings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn contains(&self, value: &str) -> bool {
        match self {
            OneOrMany::One(one) => one == value,
            OneOrMany::Many(many) => many.iter().any(|v| v == value),
        }
    }
}

impl From<&str> for OneOrMany {
    fn from(value: &str) -> Self {
        OneOrMany::One(value.to_string())
    }
}

impl From<String> for OneOrMany {
    fn from(value: String) -> Self {
        OneOrMany::One(value)
    }
}

impl From<Vec<String>> for OneOrMany {
    fn from(values: Vec<String>) -> Self {
        OneOrMany::Many(values)
    }
}

impl From<&[&str]> for OneOrMany {
    fn from(values: &[&str]) -> Self {
        OneOrMany::Many(values.iter().map(|v| v.to_string()).collect())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    Allow,
    Deny,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    #[serde(rename = "Service", skip_serializing_if = "Option::is_none")]
    pub service: Option<OneOrMany>,
    #[serde(rename = "Federated", skip_serializing_if = "Option::is_none")]
    pub federated: Option<String>,
}

/// Condition operator (`StringEquals`, ...) to condition key to value.
pub type Conditions = BTreeMap<String, BTreeMap<String, OneOrMany>>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Statement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    pub effect: Effect,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<Principal>,
    pub action: OneOrMany,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<OneOrMany>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub condition: Conditions,
}

impl Statement {
    /// Starts an `Allow` statement for `action`.
    pub fn allow<A: Into<OneOrMany>>(action: A) -> Self {
        Statement {
            sid: None,
            effect: Effect::Allow,
            principal: None,
            action: action.into(),
            resource: None,
            condition: BTreeMap::new(),
        }
    }

    pub fn sid<S: Into<String>>(mut self, sid: S) -> Self {
        self.sid = Some(sid.into());
        self
    }

    pub fn resource<R: Into<OneOrMany>>(mut self, resource: R) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn service_principal<S: Into<OneOrMany>>(mut self, service: S) -> Self {
        self.principal = Some(Principal {
            service: Some(service.into()),
            federated: None,
        });
        self
    }

    pub fn federated_principal<S: Into<String>>(mut self, provider_arn: S) -> Self {
        self.principal = Some(Principal {
            service: None,
            federated: Some(provider_arn.into()),
        });
        self
    }

    pub fn condition<O, K, V>(mut self, operator: O, key: K, value: V) -> Self
    where
        O: Into<String>,
        K: Into<String>,
        V: Into<OneOrMany>,
    {
        self.condition
            .entry(operator.into())
            .or_default()
            .insert(key.into(), value.into());
        self
    }

    /// The value of one condition key, if present.
    pub fn condition_value(&self, operator: &str, key: &str) -> Option<&OneOrMany> {
        self.condition.get(operator).and_then(|keys| keys.get(key))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub version: String,
    pub statement: Vec<Statement>,
}

impl PolicyDocument {
    pub fn new(statement: Vec<Statement>) -> Self {
        PolicyDocument {
            id: None,
            version: IAM_POLICY_VERSION.to_string(),
            statement,
        }
    }

    pub fn with_id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn parse(document: &str) -> Result<Self> {
        serde_json::from_str(document).context(policy_error::ParseSnafu)
    }

    /// The pretty-printed JSON document.
    pub fn render(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context(policy_error::RenderSnafu)
    }

    pub fn statement_by_sid(&self, sid: &str) -> Option<&Statement> {
        self.statement
            .iter()
            .find(|statement| statement.sid.as_deref() == Some(sid))
    }
}

/// A named policy embedded in a role.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlinePolicy {
    pub name: String,
    pub policy: PolicyDocument,
}

impl InlinePolicy {
    pub fn new<S: Into<String>>(name: S, policy: PolicyDocument) -> Self {
        InlinePolicy {
            name: name.into(),
            policy,
        }
    }
}

pub type Result<T> = std::result::Result<T, policy_error::Error>;

pub mod policy_error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to parse policy document: {}", source))]
        Parse { source: serde_json::Error },

        #[snafu(display("Unable to render policy document: {}", source))]
        Render { source: serde_json::Error },
    }
}
