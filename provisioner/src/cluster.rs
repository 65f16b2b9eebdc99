//! The principal EKS cluster: its service role, subnet and security group tags, the OIDC identity
//! provider derived from its issuer, and the cluster-level stack exports.
use crate::collaborators::Collaborators;
use crate::error::{self, Result};
use crate::identity::{create_oidc_provider, create_service_role, OidcIssuer, RoleConfig};
use models::component_token;
use models::constants::{
    cluster_ownership_tag, CLUSTER_OWNED_TAG_VALUE, EKS_CLUSTER_POLICY_ARN,
    EKS_SERVICE_PRINCIPAL, KARPENTER_DISCOVERY_TAG,
};
use models::graph::ResourceKind;
use models::output::{Output, OutputError, OutputResult};
use models::stack::{Resource, ResourceArgs, ResourceOptions, Stack};

use maplit::btreemap;
use serde_json::{json, Value};
use snafu::{ensure, ResultExt};
use tracing::{event, instrument, Level};

pub const KUBECONFIG_EXPORT: &str = "kubeconfig";
pub const ISSUER_URL_EXPORT: &str = "IssuerUrl";
pub const ISSUER_URL_WITHOUT_PREFIX_EXPORT: &str = "IssuerUrlWithoutPrefix";
pub const CLUSTER_SECURITY_GROUP_EXPORT: &str = "ClusterSecurityGroupId";
pub const CLUSTER_NAME_EXPORT: &str = "ClusterName";

#[derive(Clone, Debug)]
pub struct ClusterArgs {
    /// Both the logical name of the component and the EKS cluster name.
    pub name: String,
    pub account_id: String,
    pub region: String,
    pub kubernetes_version: String,
    pub subnet_ids: Output<Vec<String>>,
}

/// Handles to everything `create_cluster` declared.
#[derive(Clone, Debug)]
pub struct PrincipalCluster {
    /// The EKS cluster name.
    pub name: String,
    pub component: Resource,
    pub role: Resource,
    pub cluster: Resource,
    pub cluster_name: Output<String>,
    pub issuer_url: Output<String>,
    pub security_group_id: Output<String>,
    pub oidc: OidcIssuer,
    pub kubeconfig: Option<Output<String>>,
}

impl PrincipalCluster {
    pub fn oidc_provider(&self) -> &Resource {
        &self.oidc.provider
    }

    pub fn issuer_url_without_scheme(&self) -> &Output<String> {
        &self.oidc.issuer_url_without_scheme
    }
}

/// Drops the URI scheme of an issuer URL and keeps host and path verbatim.
///
/// `https://oidc.eks.us-west-2.amazonaws.com/id/X` becomes `oidc.eks.us-west-2.amazonaws.com/id/X`.
/// A URL without a scheme is returned unchanged.
pub fn strip_scheme(url: &str) -> OutputResult<String> {
    let stripped = url.split_once("://").map_or(url, |(_, rest)| rest);
    if stripped.is_empty() {
        return Err(OutputError::assertion(format!(
            "issuer URL '{}' has no host",
            url
        )));
    }
    Ok(stripped.to_string())
}

/// The first OIDC issuer of the first identity in an EKS cluster's `identities` attribute.
fn first_issuer(identities: &Value) -> OutputResult<String> {
    identities
        .get(0)
        .and_then(|identity| identity.get("oidcs"))
        .and_then(|oidcs| oidcs.get(0))
        .and_then(|oidc| oidc.get("issuer"))
        .and_then(Value::as_str)
        .filter(|issuer| !issuer.is_empty())
        .map(str::to_string)
        .ok_or_else(|| OutputError::assertion("the cluster reported no OIDC issuer"))
}

/// Declares the principal cluster.
///
/// Fails immediately when the name is empty. An absent issuer or a failing thumbprint lookup
/// fails the OIDC provider, and with it every IRSA role.
#[instrument(skip(stack, args, collaborators, options), fields(cluster = %args.name))]
pub fn create_cluster(
    stack: &Stack,
    args: ClusterArgs,
    collaborators: &Collaborators,
    options: ResourceOptions,
) -> Result<PrincipalCluster> {
    let name = args.name.clone();
    ensure!(
        !name.is_empty(),
        error::AssertionSnafu {
            message: "cluster name is empty"
        }
    );

    let component = stack
        .register_component(component_token!("cluster", "PrincipalCluster"), &name, options)
        .context(error::DeclareSnafu)?;

    let role = create_service_role(
        stack,
        &format!("{}-eks-cluster-role", name),
        &[EKS_SERVICE_PRINCIPAL],
        &RoleConfig::new().managed_policy(EKS_CLUSTER_POLICY_ARN),
        ResourceOptions::new().parent(&component),
    )?;

    let cluster = stack
        .register(
            ResourceKind::EksCluster,
            format!("{}-eks-cluster", name),
            ResourceArgs::new()
                .set("name", &name)
                .set("version", &args.kubernetes_version)
                .set_output("roleArn", &role.arn())
                .set_output(
                    "vpcConfig",
                    &args
                        .subnet_ids
                        .map(|subnet_ids| json!({ "subnetIds": subnet_ids })),
                )
                .set("tags", btreemap! { KARPENTER_DISCOVERY_TAG => name.as_str() }),
            ResourceOptions::new().parent(&component),
        )
        .context(error::DeclareSnafu)?;
    let cluster_name = cluster.name();

    tag_subnets(stack, &name, &cluster, &args.subnet_ids)?;

    let cluster_id = cluster.id().to_string();
    let security_group_id = cluster.output("vpcConfig").try_map(move |vpc_config| {
        vpc_config
            .get("clusterSecurityGroupId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(OutputError::InvalidOutput {
                resource: cluster_id,
                key: "vpcConfig".to_string(),
                message: "no clusterSecurityGroupId".to_string(),
            })
    });
    stack
        .register(
            ResourceKind::Ec2Tag,
            format!("{}-TagClusterSecurityGroup", name),
            ResourceArgs::new()
                .set_output("resourceId", &security_group_id)
                .set("key", KARPENTER_DISCOVERY_TAG)
                .set_output("value", &cluster_name),
            ResourceOptions::new().parent(&cluster).depends_on(&cluster),
        )
        .context(error::DeclareSnafu)?;

    let issuer_url = cluster
        .output("identities")
        .try_map(|identities| first_issuer(&identities));
    let issuer_url_without_scheme = issuer_url.try_map(|url| strip_scheme(&url));

    let fetcher = collaborators.thumbprint.clone();
    let thumbprint = cluster_name.apply(move |cluster_name| async move {
        if cluster_name.is_empty() {
            return Err(OutputError::assertion("cluster name is empty"));
        }
        fetcher
            .thumbprint(&cluster_name)
            .await
            .map_err(|e| OutputError::collaborator("thumbprint lookup", e))
    });
    let provider = create_oidc_provider(
        stack,
        &format!("{}-IdentityProviderOidc", name),
        &issuer_url,
        &thumbprint,
        ResourceOptions::new().parent(&cluster),
    )?;

    let kubeconfig = collaborators.kubeconfig.clone().map(|source| {
        let region = args.region.clone();
        cluster_name.apply(move |cluster_name| async move {
            source
                .kubeconfig(&region, &cluster_name)
                .await
                .map_err(|e| OutputError::collaborator("kubeconfig", e))
        })
    });

    if let Some(kubeconfig) = &kubeconfig {
        stack
            .export(KUBECONFIG_EXPORT, kubeconfig)
            .context(error::DeclareSnafu)?;
    }
    for (key, value) in [
        (ISSUER_URL_EXPORT, &issuer_url),
        (ISSUER_URL_WITHOUT_PREFIX_EXPORT, &issuer_url_without_scheme),
        (CLUSTER_SECURITY_GROUP_EXPORT, &security_group_id),
        (CLUSTER_NAME_EXPORT, &cluster_name),
    ] {
        stack.export(key, value).context(error::DeclareSnafu)?;
    }
    event!(Level::INFO, "Declared cluster.");

    Ok(PrincipalCluster {
        name,
        component,
        role,
        cluster,
        cluster_name,
        issuer_url,
        security_group_id,
        oidc: OidcIssuer {
            account_id: args.account_id,
            issuer_url_without_scheme,
            provider,
        },
        kubeconfig,
    })
}

/// Tags every subnet once the subnet list is known: cluster ownership and Karpenter discovery.
fn tag_subnets(
    stack: &Stack,
    name: &str,
    cluster: &Resource,
    subnet_ids: &Output<Vec<String>>,
) -> Result<()> {
    let declaring_stack = stack.clone();
    let cluster = cluster.clone();
    let name = name.to_string();
    let task = subnet_ids.apply(move |subnet_ids| async move {
        let cluster_name = cluster.name();
        let ownership_key = cluster_name.map(|cluster_name| cluster_ownership_tag(&cluster_name));
        for (index, subnet_id) in subnet_ids.iter().enumerate() {
            declaring_stack.register(
                ResourceKind::Ec2Tag,
                format!("{}-tag-subnets-with-cluster-{}", name, index),
                ResourceArgs::new()
                    .set("resourceId", subnet_id)
                    .set_output("key", &ownership_key)
                    .set("value", CLUSTER_OWNED_TAG_VALUE),
                ResourceOptions::new().parent(&cluster),
            )?;
            declaring_stack.register(
                ResourceKind::Ec2Tag,
                format!("{}-tag-subnets-karpenter-discovery-{}", name, index),
                ResourceArgs::new()
                    .set("resourceId", subnet_id)
                    .set("key", KARPENTER_DISCOVERY_TAG)
                    .set_output("value", &cluster_name),
                ResourceOptions::new().parent(&cluster),
            )?;
        }
        event!(Level::DEBUG, subnets = subnet_ids.len(), "Declared subnet tags.");
        Ok::<(), OutputError>(())
    });
    stack
        .track("tag cluster subnets", task)
        .context(error::DeclareSnafu)
}
