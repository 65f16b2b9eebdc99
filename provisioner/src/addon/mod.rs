/*!
  Cluster add-ons that run under an IRSA role.

  Every add-on follows the same protocol: its role trusts exactly one
  `namespace:service-account` pair through the cluster's OIDC issuer, carries the add-on's
  permissions, and is then handed to whatever runs the add-on: a managed EKS add-on, a Kubernetes
  service account annotated with the role ARN, or nothing when an external chart owns the
  service account.
!*/
pub mod cluster_autoscaler;
pub mod ebs;
pub mod elb;
pub mod karpenter;
pub mod vpc_cni;

use crate::cluster::PrincipalCluster;
use crate::error::{self, Result};
use crate::identity::{create_irsa_role, RoleConfig, TrustedServiceAccount};
use models::constants::{ROLE_ARN_ANNOTATION, STS_REGIONAL_ENDPOINTS_ANNOTATION};
use models::graph::ResourceKind;
use models::output::OutputError;
use models::stack::{Resource, ResourceArgs, ResourceOptions, Stack};

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use maplit::btreemap;
use snafu::{OptionExt, ResultExt};
use tracing::{event, instrument, Level};

use std::collections::BTreeMap;

/// How an add-on consumes its role.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Install {
    /// An EKS managed add-on with `serviceAccountRoleArn` set to the role.
    ManagedAddon {
        addon_name: String,
        addon_version: Option<String>,
        resolve_conflicts_on_update: Option<String>,
    },
    /// A service account annotated with the role ARN.
    ServiceAccount { labels: BTreeMap<String, String> },
    /// The service account is created by something outside the stack.
    External,
}

/// An add-on bound to one service account.
#[derive(Clone, Debug)]
pub struct IrsaAddon {
    /// Logical name of the add-on's component; other logical names derive from it.
    pub name: String,
    /// `<package>:<module>:<type>` of the component `install` declares. Unset for add-ons that
    /// are declared under an existing component with `install_under`.
    pub token: Option<&'static str>,
    pub service_account: TrustedServiceAccount,
    pub permissions: RoleConfig,
    pub install: Install,
}

/// Handles to an installed add-on.
#[derive(Clone, Debug)]
pub struct InstalledAddon {
    pub component: Resource,
    pub role: Resource,
    /// The managed add-on or service account, absent for external installs.
    pub handle: Option<Resource>,
}

impl IrsaAddon {
    pub fn role_name(&self) -> String {
        format!("{}-role", self.name)
    }

    /// Declares the component, the IRSA role and the install target.
    #[instrument(skip_all, fields(addon = %self.name))]
    pub fn install(
        &self,
        stack: &Stack,
        cluster: &PrincipalCluster,
        options: ResourceOptions,
    ) -> Result<InstalledAddon> {
        let token = self.token.context(error::AssertionSnafu {
            message: format!("add-on '{}' has no component type", self.name),
        })?;
        let component = stack
            .register_component(token, &self.name, options)
            .context(error::DeclareSnafu)?;
        self.install_under(stack, cluster, component)
    }

    /// Like `install`, with a component that the caller already declared.
    pub(crate) fn install_under(
        &self,
        stack: &Stack,
        cluster: &PrincipalCluster,
        component: Resource,
    ) -> Result<InstalledAddon> {
        let role = create_irsa_role(
            stack,
            &self.role_name(),
            &cluster.oidc,
            &self.service_account,
            &self.permissions,
            ResourceOptions::new().parent(&component),
        )?;

        let handle = match &self.install {
            Install::ManagedAddon {
                addon_name,
                addon_version,
                resolve_conflicts_on_update,
            } => {
                let mut args = ResourceArgs::new()
                    .set_output("clusterName", &cluster.cluster_name)
                    .set("addonName", addon_name)
                    .set_output("serviceAccountRoleArn", &role.arn());
                if let Some(version) = addon_version {
                    args = args.set("addonVersion", version);
                }
                if let Some(resolve) = resolve_conflicts_on_update {
                    args = args.set("resolveConflictsOnUpdate", resolve);
                }
                Some(
                    stack
                        .register(
                            ResourceKind::EksAddon,
                            format!("{}-addon", self.name),
                            args,
                            ResourceOptions::new().parent(&component),
                        )
                        .context(error::DeclareSnafu)?,
                )
            }
            Install::ServiceAccount { labels } => {
                let trusted = self.service_account.clone();
                let labels = labels.clone();
                let metadata = role.arn().try_map(move |role_arn| {
                    serde_json::to_value(
                        service_account_manifest(&trusted, &labels, &role_arn).metadata,
                    )
                    .map_err(|e| OutputError::Serialize {
                        message: e.to_string(),
                    })
                });
                Some(
                    stack
                        .register(
                            ResourceKind::KubernetesServiceAccount,
                            format!("{}-service-account", self.name),
                            ResourceArgs::new()
                                .set("apiVersion", "v1")
                                .set("kind", "ServiceAccount")
                                .set_output("metadata", &metadata),
                            ResourceOptions::new().parent(&component).depends_on(&role),
                        )
                        .context(error::DeclareSnafu)?,
                )
            }
            Install::External => None,
        };
        event!(Level::DEBUG, role = %role.id(), "Declared add-on.");

        Ok(InstalledAddon {
            component,
            role,
            handle,
        })
    }
}

/// The service account an IRSA role is handed to.
pub fn service_account_manifest(
    trusted: &TrustedServiceAccount,
    labels: &BTreeMap<String, String>,
    role_arn: &str,
) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(trusted.name.clone()),
            namespace: Some(trusted.namespace.clone()),
            labels: (!labels.is_empty()).then(|| labels.clone()),
            annotations: Some(btreemap! {
                ROLE_ARN_ANNOTATION.to_string() => role_arn.to_string(),
                STS_REGIONAL_ENDPOINTS_ANNOTATION.to_string() => "true".to_string(),
            }),
            ..Default::default()
        },
        ..Default::default()
    }
}
