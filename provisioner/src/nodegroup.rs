//! Managed node groups.
//!
//! Every node group runs under a worker role that trusts EC2 and carries the same four managed
//! policies. The generic node group fixes its shape; an open node group takes the whole shape from
//! the caller and only receives the worker role.
use crate::error::{self, Result};
use crate::identity::{create_service_role, RoleConfig};
use models::component_token;
use models::config::{CapacityType, NodeGroupConfig, NodeGroupPreset, ScalingConfig};
use models::constants::{EC2_SERVICE_PRINCIPAL, WORKER_NODE_POLICY_ARNS};
use models::graph::ResourceKind;
use models::output::Output;
use models::stack::{Resource, ResourceArgs, ResourceOptions, Stack};

use snafu::ResultExt;
use tracing::{event, Level};
use validator::Validate;

use std::collections::BTreeMap;

pub const GENERIC_SCALING: ScalingConfig = ScalingConfig::new(2, 4, 6);
pub const AMD64_SCALING: ScalingConfig = ScalingConfig::new(2, 2, 6);
pub const BOOTSTRAP_SCALING: ScalingConfig = ScalingConfig::new(0, 0, 1);

const ARM64_AMI_TYPE: &str = "AL2_ARM_64";
const AMD64_AMI_TYPE: &str = "AL2_x86_64";
const GENERIC_INSTANCE_TYPE: &str = "t4g.small";
const AMD64_INSTANCE_TYPE: &str = "t3.medium";
const DEFAULT_DISK_SIZE: u32 = 5;

/// The shape of a managed node group.
#[derive(Clone, Debug)]
pub struct NodeGroupArgs {
    pub cluster_name: Output<String>,
    pub capacity_type: CapacityType,
    pub instance_types: Vec<String>,
    pub scaling: ScalingConfig,
    pub subnet_ids: Output<Vec<String>>,
    pub ami_type: Option<String>,
    pub disk_size: Option<u32>,
    pub labels: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
}

impl NodeGroupArgs {
    fn preset(
        cluster_name: Output<String>,
        subnet_ids: Output<Vec<String>>,
        capacity_type: CapacityType,
        instance_type: &str,
        ami_type: &str,
        scaling: ScalingConfig,
    ) -> Self {
        NodeGroupArgs {
            cluster_name,
            capacity_type,
            instance_types: vec![instance_type.to_string()],
            scaling,
            subnet_ids,
            ami_type: Some(ami_type.to_string()),
            disk_size: Some(DEFAULT_DISK_SIZE),
            labels: BTreeMap::new(),
            tags: BTreeMap::new(),
        }
    }

    /// ARM64 on-demand `t4g.small` nodes, 2/4/6.
    pub fn generic(cluster_name: Output<String>, subnet_ids: Output<Vec<String>>) -> Self {
        Self::preset(
            cluster_name,
            subnet_ids,
            CapacityType::OnDemand,
            GENERIC_INSTANCE_TYPE,
            ARM64_AMI_TYPE,
            GENERIC_SCALING,
        )
    }

    /// amd64 on-demand nodes, 2/2/6.
    pub fn amd64_on_demand(cluster_name: Output<String>, subnet_ids: Output<Vec<String>>) -> Self {
        Self::preset(
            cluster_name,
            subnet_ids,
            CapacityType::OnDemand,
            AMD64_INSTANCE_TYPE,
            AMD64_AMI_TYPE,
            AMD64_SCALING,
        )
    }

    /// amd64 spot nodes, 2/2/6.
    pub fn amd64_spot(cluster_name: Output<String>, subnet_ids: Output<Vec<String>>) -> Self {
        Self::preset(
            cluster_name,
            subnet_ids,
            CapacityType::Spot,
            AMD64_INSTANCE_TYPE,
            AMD64_AMI_TYPE,
            AMD64_SCALING,
        )
    }

    pub fn from_preset(
        preset: NodeGroupPreset,
        cluster_name: Output<String>,
        subnet_ids: Output<Vec<String>>,
    ) -> Self {
        match preset {
            NodeGroupPreset::Amd64OnDemand => Self::amd64_on_demand(cluster_name, subnet_ids),
            NodeGroupPreset::Amd64Spot => Self::amd64_spot(cluster_name, subnet_ids),
        }
    }

    /// A node group listed in the stack configuration.
    pub fn from_config(
        config: &NodeGroupConfig,
        cluster_name: Output<String>,
        subnet_ids: Output<Vec<String>>,
    ) -> Self {
        NodeGroupArgs {
            cluster_name,
            capacity_type: config.capacity_type,
            instance_types: config.instance_types.clone(),
            scaling: config.scaling,
            subnet_ids,
            ami_type: config.ami_type.clone(),
            disk_size: config.disk_size,
            labels: config.labels.clone(),
            tags: config.tags.clone(),
        }
    }
}

/// Handles to a node group and its worker role.
#[derive(Clone, Debug)]
pub struct NodeGroup {
    pub component: Resource,
    pub role: Resource,
    pub node_group: Resource,
}

/// The EC2-trusted role with the fixed worker policies.
pub fn create_worker_role(
    stack: &Stack,
    name: &str,
    role: RoleConfig,
    options: ResourceOptions,
) -> Result<Resource> {
    let role = WORKER_NODE_POLICY_ARNS
        .iter()
        .fold(role, |role, arn| role.managed_policy(arn));
    create_service_role(stack, name, &[EC2_SERVICE_PRINCIPAL], &role, options)
}

/// Declares one managed node group running under `node_role_arn`.
///
/// Fails when the scaling bounds do not satisfy `min <= desired <= max`.
pub fn create_node_group(
    stack: &Stack,
    name: &str,
    args: &NodeGroupArgs,
    node_role_arn: &Output<String>,
    options: ResourceOptions,
) -> Result<Resource> {
    args.scaling
        .validate()
        .context(error::InvalidScalingSnafu { node_group: name })?;

    let mut properties = ResourceArgs::new()
        .set_output("clusterName", &args.cluster_name)
        .set("capacityType", args.capacity_type)
        .set("instanceTypes", &args.instance_types)
        .set("scalingConfig", args.scaling)
        .set_output("subnetIds", &args.subnet_ids)
        .set_output("nodeRoleArn", node_role_arn);
    if let Some(ami_type) = &args.ami_type {
        properties = properties.set("amiType", ami_type);
    }
    if let Some(disk_size) = args.disk_size {
        properties = properties.set("diskSize", disk_size);
    }
    if !args.labels.is_empty() {
        properties = properties.set("labels", &args.labels);
    }
    if !args.tags.is_empty() {
        properties = properties.set("tags", &args.tags);
    }

    let node_group = stack
        .register(ResourceKind::EksNodeGroup, name, properties, options)
        .context(error::DeclareSnafu)?;
    event!(
        Level::DEBUG,
        node_group = name,
        min = args.scaling.min_size,
        desired = args.scaling.desired_size,
        max = args.scaling.max_size,
        "Declared node group."
    );
    Ok(node_group)
}

/// The generic ARM64 node group.
pub fn create_generic_node_group(
    stack: &Stack,
    name: &str,
    cluster_name: Output<String>,
    subnet_ids: Output<Vec<String>>,
    options: ResourceOptions,
) -> Result<NodeGroup> {
    create_open_node_group_with_token(
        stack,
        component_token!("nodegroup", "GenericGroupNode"),
        name,
        &NodeGroupArgs::generic(cluster_name, subnet_ids),
        options,
    )
}

/// A node group whose shape is supplied by the caller.
pub fn create_open_node_group(
    stack: &Stack,
    name: &str,
    args: &NodeGroupArgs,
    options: ResourceOptions,
) -> Result<NodeGroup> {
    create_open_node_group_with_token(
        stack,
        component_token!("nodegroup", "OpenNodeGroup"),
        name,
        args,
        options,
    )
}

fn create_open_node_group_with_token(
    stack: &Stack,
    token: &str,
    name: &str,
    args: &NodeGroupArgs,
    options: ResourceOptions,
) -> Result<NodeGroup> {
    let component = stack
        .register_component(token, name, options)
        .context(error::DeclareSnafu)?;
    let role = create_worker_role(
        stack,
        &format!("{}-groupnode-role", name),
        RoleConfig::new(),
        ResourceOptions::new().parent(&component),
    )?;
    let node_group = create_node_group(
        stack,
        name,
        args,
        &role.arn(),
        ResourceOptions::new().parent(&component),
    )?;
    Ok(NodeGroup {
        component,
        role,
        node_group,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::engine::PreviewEngine;
    use serde_json::json;
    use std::sync::Arc;

    fn stack() -> Stack {
        Stack::new(Arc::new(PreviewEngine::new("123456789012", "us-west-2")))
    }

    fn subnets() -> Output<Vec<String>> {
        Output::known(vec!["subnet-a".to_string()])
    }

    #[test]
    fn test_preset_bounds_are_valid() {
        for scaling in [GENERIC_SCALING, AMD64_SCALING, BOOTSTRAP_SCALING] {
            assert!(scaling.validate().is_ok(), "{:?}", scaling);
        }
    }

    #[test]
    fn test_invalid_bounds_are_rejected() {
        let stack = stack();
        let mut args = NodeGroupArgs::amd64_spot(Output::known("cluster".to_string()), subnets());
        args.scaling = ScalingConfig::new(3, 2, 6);

        let result = create_open_node_group(&stack, "spot", &args, ResourceOptions::new());
        assert!(matches!(
            result,
            Err(error::Error::InvalidScaling { ref node_group, .. }) if node_group == "spot"
        ));
        // The component and role were declared, the node group was not.
        assert_eq!(
            stack
                .declarations_of(&ResourceKind::EksNodeGroup)
                .unwrap()
                .len(),
            0
        );
    }

    #[tokio::test]
    async fn test_generic_node_group() {
        let stack = stack();
        let group = create_generic_node_group(
            &stack,
            "genericGroupNode",
            Output::known("principal-cluster".to_string()),
            subnets(),
            ResourceOptions::new(),
        )
        .unwrap();
        stack.apply().await.unwrap();

        let declaration = stack.declaration(group.node_group.id()).unwrap().unwrap();
        assert_eq!(
            declaration.property("scalingConfig"),
            Some(&json!({ "minSize": 2, "desiredSize": 4, "maxSize": 6 }))
        );
        assert_eq!(declaration.str_property("amiType"), Some("AL2_ARM_64"));
        assert_eq!(declaration.str_property("capacityType"), Some("ON_DEMAND"));
        assert_eq!(declaration.property("instanceTypes"), Some(&json!(["t4g.small"])));
        assert_eq!(declaration.property("diskSize"), Some(&json!(5)));
        assert_eq!(
            declaration.str_property("nodeRoleArn"),
            Some("arn:aws:iam::123456789012:role/genericGroupNode-groupnode-role")
        );

        let role = stack.declaration(group.role.id()).unwrap().unwrap();
        assert_eq!(
            role.property("managedPolicyArns"),
            Some(&json!(WORKER_NODE_POLICY_ARNS))
        );
    }

    #[tokio::test]
    async fn test_spot_preset() {
        let stack = stack();
        let args = NodeGroupArgs::amd64_spot(Output::known("principal-cluster".to_string()), subnets());
        let group =
            create_open_node_group(&stack, "amd64-spot", &args, ResourceOptions::new()).unwrap();
        stack.apply().await.unwrap();

        let declaration = stack.declaration(group.node_group.id()).unwrap().unwrap();
        assert_eq!(declaration.str_property("capacityType"), Some("SPOT"));
        assert_eq!(
            declaration.property("scalingConfig"),
            Some(&json!({ "minSize": 2, "desiredSize": 2, "maxSize": 6 }))
        );
    }

    #[tokio::test]
    async fn test_amd64_on_demand_preset() {
        let stack = stack();
        let args = NodeGroupArgs::from_preset(
            NodeGroupPreset::Amd64OnDemand,
            Output::known("principal-cluster".to_string()),
            subnets(),
        );
        let group = create_open_node_group(
            &stack,
            &NodeGroupPreset::Amd64OnDemand.to_string(),
            &args,
            ResourceOptions::new(),
        )
        .unwrap();
        stack.apply().await.unwrap();

        let declaration = stack.declaration(group.node_group.id()).unwrap().unwrap();
        assert_eq!(declaration.str_property("capacityType"), Some("ON_DEMAND"));
        assert_eq!(declaration.str_property("amiType"), Some("AL2_x86_64"));
        assert_eq!(declaration.property("instanceTypes"), Some(&json!(["t3.medium"])));
        assert_eq!(declaration.property("diskSize"), Some(&json!(5)));
        assert_eq!(
            declaration.property("scalingConfig"),
            Some(&json!({ "minSize": 2, "desiredSize": 2, "maxSize": 6 }))
        );
        assert_eq!(
            declaration.str_property("nodeRoleArn"),
            Some("arn:aws:iam::123456789012:role/amd64-on-demand-groupnode-role")
        );
    }
}
