//! The EBS CSI driver as a managed add-on.
use super::{InstalledAddon, Install, IrsaAddon};
use crate::cluster::PrincipalCluster;
use crate::error::Result;
use crate::identity::{RoleConfig, TrustedServiceAccount};
use models::component_token;
use models::constants::{EBS_CSI_DRIVER_POLICY_ARN, KUBE_SYSTEM_NAMESPACE};
use models::stack::{ResourceOptions, Stack};

pub const SERVICE_ACCOUNT: &str = "ebs-csi-controller-sa";
pub const ADDON_NAME: &str = "aws-ebs-csi-driver";

pub fn ebs_csi_addon(name: &str) -> IrsaAddon {
    IrsaAddon {
        name: name.to_string(),
        token: Some(component_token!("addon", "EbsController")),
        service_account: TrustedServiceAccount::new(KUBE_SYSTEM_NAMESPACE, SERVICE_ACCOUNT),
        permissions: RoleConfig::new().managed_policy(EBS_CSI_DRIVER_POLICY_ARN),
        install: Install::ManagedAddon {
            addon_name: ADDON_NAME.to_string(),
            addon_version: None,
            resolve_conflicts_on_update: None,
        },
    }
}

pub fn create_ebs_csi_driver(
    stack: &Stack,
    name: &str,
    cluster: &PrincipalCluster,
    options: ResourceOptions,
) -> Result<InstalledAddon> {
    ebs_csi_addon(name).install(stack, cluster, options)
}
