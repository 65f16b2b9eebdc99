//! Stack configuration.
//!
//! Settings come from an optional YAML file and are overridden by environment variables. The
//! account, organization, stack and region are required; everything else has a default.
use crate::constants::{
    DEFAULT_CLUSTER_NAME, DEFAULT_GATEWAY_ENDPOINT_SERVICES, DEFAULT_INTERFACE_ENDPOINT_SERVICES,
    DEFAULT_KUBERNETES_VERSION, DEFAULT_NETWORK_PROJECT,
};

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt};
use strum_macros::Display;
use validator::{Validate, ValidationError};

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

pub const ACCOUNT_ENV_VAR: &str = "EKS_ACCOUNT";
pub const ORG_ENV_VAR: &str = "EKS_ORG";
pub const STACK_ENV_VAR: &str = "EKS_STACK";
pub const REGION_ENV_VAR: &str = "AWS_REGION";
pub const CLUSTER_NAME_ENV_VAR: &str = "EKS_CLUSTER_NAME";
pub const KUBERNETES_VERSION_ENV_VAR: &str = "EKS_KUBERNETES_VERSION";
pub const NETWORK_PROJECT_ENV_VAR: &str = "EKS_NETWORK_PROJECT";
pub const AUTOSCALING_ENV_VAR: &str = "EKS_AUTOSCALING";

lazy_static! {
    static ref ACCOUNT_ID_RE: Regex = Regex::new(r"^\d{12}$").unwrap();
    static ref REGION_RE: Regex = Regex::new(r"^[a-z]{2}(-gov)?-[a-z]+-\d$").unwrap();
    // EKS cluster names: 1-100 characters, alphanumerics, hyphens and underscores.
    static ref CLUSTER_NAME_RE: Regex = Regex::new(r"^[0-9A-Za-z][A-Za-z0-9\-_]{0,99}$").unwrap();
    static ref KUBERNETES_VERSION_RE: Regex = Regex::new(r"^1\.\d{2}$").unwrap();
}

/// Which autoscaler, if any, the cluster runs.
#[derive(Copy, Clone, Debug, Display, Eq, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Autoscaling {
    #[default]
    None,
    ClusterAutoscaler,
    Karpenter,
}

impl FromStr for Autoscaling {
    type Err = serde_plain::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        serde_plain::from_str(s)
    }
}

#[derive(Copy, Clone, Debug, Display, Eq, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CapacityType {
    #[default]
    OnDemand,
    Spot,
}

/// A node group whose shape is fixed by the provisioner; the preset name is the node group name.
#[derive(Copy, Clone, Debug, Display, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum NodeGroupPreset {
    Amd64OnDemand,
    Amd64Spot,
}

/// Node group scaling bounds. A node group is only declared when `min <= desired <= max`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
#[validate(schema(function = "validate_scaling_bounds"))]
pub struct ScalingConfig {
    pub min_size: u32,
    pub desired_size: u32,
    pub max_size: u32,
}

impl ScalingConfig {
    pub const fn new(min_size: u32, desired_size: u32, max_size: u32) -> Self {
        ScalingConfig {
            min_size,
            desired_size,
            max_size,
        }
    }
}

fn validate_scaling_bounds(scaling: &ScalingConfig) -> std::result::Result<(), ValidationError> {
    if scaling.min_size <= scaling.desired_size && scaling.desired_size <= scaling.max_size {
        Ok(())
    } else {
        Err(ValidationError::new("scaling_bounds"))
    }
}

/// A node group whose full configuration is supplied by the stack configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "snake_case")]
pub struct NodeGroupConfig {
    #[validate(regex = "CLUSTER_NAME_RE")]
    pub name: String,
    #[serde(default)]
    pub capacity_type: CapacityType,
    #[validate(length(min = 1))]
    pub instance_types: Vec<String>,
    #[validate]
    pub scaling: ScalingConfig,
    #[serde(default)]
    pub ami_type: Option<String>,
    #[serde(default)]
    pub disk_size: Option<u32>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// The validated configuration of one stack.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Validate)]
pub struct StackConfig {
    #[validate(regex = "ACCOUNT_ID_RE")]
    pub account: String,
    #[validate(length(min = 1))]
    pub org: String,
    #[validate(length(min = 1))]
    pub stack: String,
    #[validate(regex = "REGION_RE")]
    pub region: String,
    /// The project holding the network stack this cluster is placed in.
    #[validate(length(min = 1))]
    pub network_project: String,
    #[validate(regex = "CLUSTER_NAME_RE")]
    pub cluster_name: String,
    #[validate(regex = "KUBERNETES_VERSION_RE")]
    pub kubernetes_version: String,
    pub autoscaling: Autoscaling,
    #[validate]
    pub node_groups: Vec<NodeGroupConfig>,
    pub preset_node_groups: Vec<NodeGroupPreset>,
    pub interface_endpoints: Vec<String>,
    pub gateway_endpoints: Vec<String>,
    /// A fixed OIDC thumbprint, used instead of running the thumbprint script.
    pub thumbprint: Option<String>,
    /// Whether to export the cluster's kubeconfig.
    pub export_kubeconfig: bool,
}

/// The configuration file as written; every setting is optional until merged.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StackConfigFile {
    pub account: Option<String>,
    pub org: Option<String>,
    pub stack: Option<String>,
    pub region: Option<String>,
    pub network_project: Option<String>,
    pub cluster_name: Option<String>,
    pub kubernetes_version: Option<String>,
    pub autoscaling: Option<Autoscaling>,
    #[serde(default)]
    pub node_groups: Vec<NodeGroupConfig>,
    #[serde(default)]
    pub preset_node_groups: Vec<NodeGroupPreset>,
    pub interface_endpoints: Option<Vec<String>>,
    pub gateway_endpoints: Option<Vec<String>>,
    pub thumbprint: Option<String>,
    #[serde(default)]
    pub export_kubeconfig: bool,
}

impl StackConfigFile {
    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents).context(config_error::ParseYamlSnafu)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).context(config_error::ReadFileSnafu {
            path: path.display().to_string(),
        })?;
        Self::from_yaml(&contents)
    }

    /// Replaces settings with the values `lookup` returns for their environment variables.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let overrides = [
            (ACCOUNT_ENV_VAR, &mut self.account),
            (ORG_ENV_VAR, &mut self.org),
            (STACK_ENV_VAR, &mut self.stack),
            (REGION_ENV_VAR, &mut self.region),
            (CLUSTER_NAME_ENV_VAR, &mut self.cluster_name),
            (KUBERNETES_VERSION_ENV_VAR, &mut self.kubernetes_version),
            (NETWORK_PROJECT_ENV_VAR, &mut self.network_project),
        ];
        for (name, setting) in overrides {
            if let Some(value) = lookup(name) {
                *setting = Some(value);
            }
        }
        if let Some(value) = lookup(AUTOSCALING_ENV_VAR) {
            self.autoscaling = Some(value.parse().context(config_error::InvalidOverrideSnafu {
                name: AUTOSCALING_ENV_VAR,
                value: value.clone(),
            })?);
        }
        Ok(self)
    }

    /// Fills in defaults and validates the result.
    pub fn resolve(self) -> Result<StackConfig> {
        let config = StackConfig {
            account: self
                .account
                .context(config_error::MissingSettingSnafu { setting: "account" })?,
            org: self
                .org
                .context(config_error::MissingSettingSnafu { setting: "org" })?,
            stack: self
                .stack
                .context(config_error::MissingSettingSnafu { setting: "stack" })?,
            region: self
                .region
                .context(config_error::MissingSettingSnafu { setting: "region" })?,
            network_project: self
                .network_project
                .unwrap_or_else(|| DEFAULT_NETWORK_PROJECT.to_string()),
            cluster_name: self
                .cluster_name
                .unwrap_or_else(|| DEFAULT_CLUSTER_NAME.to_string()),
            kubernetes_version: self
                .kubernetes_version
                .unwrap_or_else(|| DEFAULT_KUBERNETES_VERSION.to_string()),
            autoscaling: self.autoscaling.unwrap_or_default(),
            node_groups: self.node_groups,
            preset_node_groups: self.preset_node_groups,
            interface_endpoints: self.interface_endpoints.unwrap_or_else(|| {
                DEFAULT_INTERFACE_ENDPOINT_SERVICES
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            }),
            gateway_endpoints: self.gateway_endpoints.unwrap_or_else(|| {
                DEFAULT_GATEWAY_ENDPOINT_SERVICES
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            }),
            thumbprint: self.thumbprint,
            export_kubeconfig: self.export_kubeconfig,
        };
        config.validate().context(config_error::InvalidSnafu)?;
        Ok(config)
    }
}

impl StackConfig {
    /// Loads the configuration file, when given, and applies the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => StackConfigFile::from_path(path)?,
            None => StackConfigFile::default(),
        };
        file.with_overrides(|name| std::env::var(name).ok())?
            .resolve()
    }

    /// `<org>/<project>/<stack>` of the network stack.
    pub fn network_stack_path(&self) -> String {
        format!("{}/{}/{}", self.org, self.network_project, self.stack)
    }
}

pub type Result<T> = std::result::Result<T, config_error::Error>;

pub mod config_error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to read configuration file '{}': {}", path, source))]
        ReadFile {
            path: String,
            source: std::io::Error,
        },

        #[snafu(display("Unable to parse configuration: {}", source))]
        ParseYaml { source: serde_yaml::Error },

        #[snafu(display("Missing required setting '{}'", setting))]
        MissingSetting { setting: String },

        #[snafu(display("Invalid value '{}' for '{}': {}", value, name, source))]
        InvalidOverride {
            name: String,
            value: String,
            source: serde_plain::Error,
        },

        #[snafu(display("Invalid configuration: {}", source))]
        Invalid { source: validator::ValidationErrors },
    }
}
