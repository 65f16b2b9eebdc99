//! The Amazon VPC CNI plugin as a managed add-on.
use super::{InstalledAddon, Install, IrsaAddon};
use crate::cluster::PrincipalCluster;
use crate::error::{self, Result};
use crate::identity::{RoleConfig, TrustedServiceAccount};
use models::component_token;
use models::constants::{EKS_CNI_POLICY_ARN, KUBE_SYSTEM_NAMESPACE, VPC_CNI_ADDON_VERSION};
use models::stack::{ResourceOptions, Stack};

use snafu::ResultExt;

pub const SERVICE_ACCOUNT: &str = "aws-node";
pub const ADDON_NAME: &str = "vpc-cni";
pub const VERSION_EXPORT: &str = "VpcCniVersion";

pub fn vpc_cni_addon(name: &str) -> IrsaAddon {
    IrsaAddon {
        name: name.to_string(),
        token: Some(component_token!("addon", "VpcCni")),
        service_account: TrustedServiceAccount::new(KUBE_SYSTEM_NAMESPACE, SERVICE_ACCOUNT),
        permissions: RoleConfig::new().managed_policy(EKS_CNI_POLICY_ARN),
        install: Install::ManagedAddon {
            addon_name: ADDON_NAME.to_string(),
            addon_version: Some(VPC_CNI_ADDON_VERSION.to_string()),
            resolve_conflicts_on_update: Some("OVERWRITE".to_string()),
        },
    }
}

/// Installs the VPC CNI add-on and exports its version.
pub fn create_vpc_cni(
    stack: &Stack,
    name: &str,
    cluster: &PrincipalCluster,
    options: ResourceOptions,
) -> Result<InstalledAddon> {
    let installed = vpc_cni_addon(name).install(stack, cluster, options)?;
    if let Some(addon) = &installed.handle {
        stack
            .export(VERSION_EXPORT, &addon.string_output("addonVersion"))
            .context(error::DeclareSnafu)?;
    }
    Ok(installed)
}
