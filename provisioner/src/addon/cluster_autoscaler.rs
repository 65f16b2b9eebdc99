//! The Kubernetes Cluster Autoscaler's role and service account.
use super::{InstalledAddon, Install, IrsaAddon};
use crate::cluster::PrincipalCluster;
use crate::error::{self, Result};
use crate::identity::{RoleConfig, TrustedServiceAccount};
use models::component_token;
use models::constants::KUBE_SYSTEM_NAMESPACE;
use models::policy::cluster_autoscaler_policy;
use models::stack::{ResourceOptions, Stack};

use maplit::btreemap;
use snafu::ResultExt;

pub const SERVICE_ACCOUNT: &str = "cluster-autoscaler";

pub fn cluster_autoscaler_addon(name: &str) -> Result<IrsaAddon> {
    let policy = cluster_autoscaler_policy().context(error::PolicySnafu { resource: name })?;
    Ok(IrsaAddon {
        name: name.to_string(),
        token: Some(component_token!("addon", "ClusterAutoscaling")),
        service_account: TrustedServiceAccount::new(KUBE_SYSTEM_NAMESPACE, SERVICE_ACCOUNT),
        permissions: RoleConfig::new().inline_policy(policy),
        install: Install::ServiceAccount {
            labels: btreemap! {
                "k8s-addon".to_string() => "cluster-autoscaler.addons.k8s.io".to_string(),
                "k8s-app".to_string() => SERVICE_ACCOUNT.to_string(),
            },
        },
    })
}

pub fn create_cluster_autoscaler(
    stack: &Stack,
    name: &str,
    cluster: &PrincipalCluster,
    options: ResourceOptions,
) -> Result<InstalledAddon> {
    cluster_autoscaler_addon(name)?.install(stack, cluster, options)
}
