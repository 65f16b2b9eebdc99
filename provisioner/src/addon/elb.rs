//! The AWS Load Balancer Controller.
//!
//! The stack only declares the controller's role and service account. The Helm chart is installed
//! afterwards by [`install_controller`], once the cluster exists.
use super::{InstalledAddon, Install, IrsaAddon};
use crate::cluster::PrincipalCluster;
use crate::collaborators::ElbInstaller;
use crate::error::{self, Result};
use crate::identity::{RoleConfig, TrustedServiceAccount};
use models::component_token;
use models::constants::{APP_COMPONENT, APP_NAME, KUBE_SYSTEM_NAMESPACE};
use models::policy::load_balancer_controller_policies;
use models::stack::{ResourceOptions, Stack};

use maplit::btreemap;
use snafu::ResultExt;
use tracing::{event, instrument, Level};

pub const SERVICE_ACCOUNT: &str = "aws-load-balancer-controller";

pub fn load_balancer_controller_addon(name: &str) -> Result<IrsaAddon> {
    let permissions = load_balancer_controller_policies()
        .context(error::PolicySnafu { resource: name })?
        .into_iter()
        .fold(RoleConfig::new(), RoleConfig::inline_policy);
    Ok(IrsaAddon {
        name: name.to_string(),
        token: Some(component_token!("addon", "ElbController")),
        service_account: TrustedServiceAccount::new(KUBE_SYSTEM_NAMESPACE, SERVICE_ACCOUNT),
        permissions,
        install: Install::ServiceAccount {
            labels: btreemap! {
                APP_COMPONENT.to_string() => "controller".to_string(),
                APP_NAME.to_string() => SERVICE_ACCOUNT.to_string(),
            },
        },
    })
}

pub fn create_load_balancer_controller(
    stack: &Stack,
    name: &str,
    cluster: &PrincipalCluster,
    options: ResourceOptions,
) -> Result<InstalledAddon> {
    load_balancer_controller_addon(name)?.install(stack, cluster, options)
}

/// Installs the controller chart into a provisioned cluster.
#[instrument(skip(installer))]
pub async fn install_controller(installer: &dyn ElbInstaller, cluster_name: &str) -> Result<()> {
    installer
        .install(cluster_name)
        .await
        .context(error::PostProvisionSnafu {
            step: "install load balancer controller",
        })?;
    event!(Level::INFO, "Load balancer controller installed.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{CollaboratorError, MockElbInstaller};
    use mockall::predicate::*;

    #[test]
    fn test_controller_carries_both_inline_policies() {
        let addon = load_balancer_controller_addon("elb-controller").unwrap();
        assert_eq!(addon.service_account.name, SERVICE_ACCOUNT);
        assert_eq!(addon.service_account.namespace, "kube-system");
        assert!(matches!(addon.install, Install::ServiceAccount { ref labels } if labels.len() == 2));
    }

    #[tokio::test]
    async fn test_install_failure_is_propagated() {
        let mut installer = MockElbInstaller::new();
        installer
            .expect_install()
            .with(eq("principal-cluster"))
            .times(1)
            .returning(|_| Err(CollaboratorError::new_with_context("helm: not found")));

        let result = install_controller(&installer, "principal-cluster").await;
        assert!(matches!(
            result,
            Err(error::Error::PostProvision { .. })
        ));
    }

    #[tokio::test]
    async fn test_install_success() {
        let mut installer = MockElbInstaller::new();
        installer.expect_install().times(1).returning(|_| Ok(()));
        install_controller(&installer, "principal-cluster")
            .await
            .unwrap();
    }
}
