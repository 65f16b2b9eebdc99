//! IAM roles and the cluster's OIDC identity provider.
//!
//! Roles come in two flavours. Service roles are assumed by an AWS service such as EKS or EC2.
//! IRSA roles are assumed through the cluster's OIDC issuer by exactly one Kubernetes service
//! account, so they cannot be created before the issuer is known and its provider exists.
use crate::error::{self, Result};
use models::constants::STS_AUDIENCE;
use models::graph::ResourceKind;
use models::output::{Output, OutputError, OutputResult};
use models::policy::trust::{service_trust_policy, IrsaTrust};
use models::policy::{InlinePolicy, PolicyDocument};
use models::stack::{Resource, ResourceArgs, ResourceOptions, Stack};

use serde_json::json;
use snafu::ResultExt;

/// Naming and permissions of a role.
#[derive(Clone, Debug, Default)]
pub struct RoleConfig {
    physical_name: Option<String>,
    path: Option<String>,
    managed_policy_arns: Vec<Output<String>>,
    inline_policies: Vec<InlinePolicy>,
}

impl RoleConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins the role's IAM name. Without it the engine picks one.
    pub fn named<S: Into<String>>(mut self, name: S) -> Self {
        self.physical_name = Some(name.into());
        self
    }

    pub fn path<S: Into<String>>(mut self, path: S) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn managed_policy(mut self, arn: &str) -> Self {
        self.managed_policy_arns.push(Output::known(arn.to_string()));
        self
    }

    /// Attaches a policy that is itself declared in the stack.
    pub fn managed_policy_output(mut self, arn: Output<String>) -> Self {
        self.managed_policy_arns.push(arn);
        self
    }

    pub fn inline_policy(mut self, policy: InlinePolicy) -> Self {
        self.inline_policies.push(policy);
        self
    }
}

/// A Kubernetes service account allowed to assume an IRSA role.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrustedServiceAccount {
    pub namespace: String,
    pub name: String,
}

impl TrustedServiceAccount {
    pub fn new<N: Into<String>, S: Into<String>>(namespace: N, name: S) -> Self {
        TrustedServiceAccount {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

/// What an IRSA role needs to know about the cluster's identity provider.
#[derive(Clone, Debug)]
pub struct OidcIssuer {
    pub account_id: String,
    /// `oidc.eks.<region>.amazonaws.com/id/<id>`
    pub issuer_url_without_scheme: Output<String>,
    pub provider: Resource,
}

/// Renders a policy document inside an output pipeline.
pub(crate) fn render_document(document: &PolicyDocument) -> OutputResult<String> {
    document.render().map_err(|e| OutputError::Serialize {
        message: e.to_string(),
    })
}

/// Declares a role trusted by the given AWS service principals.
pub fn create_service_role(
    stack: &Stack,
    name: &str,
    services: &[&str],
    role: &RoleConfig,
    options: ResourceOptions,
) -> Result<Resource> {
    let trust = service_trust_policy(services)
        .render()
        .context(error::PolicySnafu { resource: name })?;
    declare_role(stack, name, Output::known(trust), role, options)
}

/// Declares a role that only `trusted` may assume, through the cluster's OIDC issuer.
///
/// The role always waits for the OIDC provider.
pub fn create_irsa_role(
    stack: &Stack,
    name: &str,
    issuer: &OidcIssuer,
    trusted: &TrustedServiceAccount,
    role: &RoleConfig,
    options: ResourceOptions,
) -> Result<Resource> {
    let account_id = issuer.account_id.clone();
    let trusted = trusted.clone();
    let trust = issuer
        .issuer_url_without_scheme
        .try_map(move |issuer| {
            render_document(
                &IrsaTrust {
                    account_id,
                    issuer,
                    namespace: trusted.namespace,
                    service_account: trusted.name,
                }
                .document(),
            )
        });
    declare_role(
        stack,
        name,
        trust,
        role,
        options.depends_on(&issuer.provider),
    )
}

/// Declares the IAM OIDC identity provider for a cluster issuer.
pub fn create_oidc_provider(
    stack: &Stack,
    name: &str,
    issuer_url: &Output<String>,
    thumbprint: &Output<String>,
    options: ResourceOptions,
) -> Result<Resource> {
    let args = ResourceArgs::new()
        .set_output("url", issuer_url)
        .set("clientIdLists", [STS_AUDIENCE])
        .set_output("thumbprintLists", &thumbprint.map(|thumbprint| vec![thumbprint]));
    stack
        .register(ResourceKind::IamOpenIdConnectProvider, name, args, options)
        .context(error::DeclareSnafu)
}

fn declare_role(
    stack: &Stack,
    name: &str,
    trust: Output<String>,
    role: &RoleConfig,
    options: ResourceOptions,
) -> Result<Resource> {
    let mut args = ResourceArgs::new()
        .set_output("assumeRolePolicy", &trust)
        .set_output(
            "managedPolicyArns",
            &Output::all(role.managed_policy_arns.clone()),
        );
    if let Some(physical_name) = &role.physical_name {
        args = args.set("name", physical_name);
    }
    if let Some(path) = &role.path {
        args = args.set("path", path);
    }
    if !role.inline_policies.is_empty() {
        let mut inline = Vec::with_capacity(role.inline_policies.len());
        for policy in &role.inline_policies {
            let document = policy
                .policy
                .render()
                .context(error::PolicySnafu { resource: name })?;
            inline.push(json!({ "name": policy.name, "policy": document }));
        }
        args = args.set("inlinePolicies", inline);
    }

    stack
        .register(ResourceKind::IamRole, name, args, options)
        .context(error::DeclareSnafu)
}
