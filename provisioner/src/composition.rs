//! Composes the whole platform from a stack configuration and the network stack's outputs.
use crate::addon::cluster_autoscaler::create_cluster_autoscaler;
use crate::addon::ebs::create_ebs_csi_driver;
use crate::addon::elb::create_load_balancer_controller;
use crate::addon::karpenter::{create_karpenter, Karpenter};
use crate::addon::vpc_cni::create_vpc_cni;
use crate::addon::InstalledAddon;
use crate::cluster::{create_cluster, ClusterArgs, PrincipalCluster};
use crate::collaborators::Collaborators;
use crate::endpoints::{create_endpoints, EndpointArgs, VpcEndpoints};
use crate::error::Result;
use crate::network::NetworkOutputs;
use crate::nodegroup::{create_generic_node_group, create_open_node_group, NodeGroup, NodeGroupArgs};
use models::config::{Autoscaling, StackConfig};
use models::output::Output;
use models::stack::{ResourceOptions, Stack};

use tracing::{event, instrument, Level};

pub const GENERIC_NODE_GROUP: &str = "genericGroupNode";
pub const VPC_CNI: &str = "vpc-cni";
pub const EBS_CSI_DRIVER: &str = "ebs-csi-driver";
pub const LOAD_BALANCER_CONTROLLER: &str = "aws-load-balancer-controller";
pub const CLUSTER_AUTOSCALER: &str = "cluster-autoscaler";
pub const KARPENTER: &str = "karpenter";
pub const VPC_ENDPOINTS: &str = "vpc-endpoints";

/// The autoscaler the platform runs.
#[derive(Clone, Debug)]
pub enum Autoscaler {
    None,
    ClusterAutoscaler(InstalledAddon),
    Karpenter(Box<Karpenter>),
}

/// Handles to every component of the platform.
#[derive(Clone, Debug)]
pub struct Platform {
    pub cluster: PrincipalCluster,
    pub generic_node_group: NodeGroup,
    pub node_groups: Vec<NodeGroup>,
    pub vpc_cni: InstalledAddon,
    pub ebs_csi_driver: InstalledAddon,
    pub load_balancer_controller: InstalledAddon,
    pub autoscaler: Autoscaler,
    pub endpoints: VpcEndpoints,
}

/// Declares the platform into `stack`.
///
/// Nothing is created here: the declarations resolve when the stack is applied.
#[instrument(skip_all, fields(cluster = %config.cluster_name, stack = %config.stack))]
pub fn compose(
    stack: &Stack,
    network: &NetworkOutputs,
    collaborators: &Collaborators,
    config: &StackConfig,
) -> Result<Platform> {
    let subnet_ids = Output::known(network.subnet_ids.clone());
    let private_subnet_ids = Output::known(network.private_subnet_ids.clone());

    let cluster = create_cluster(
        stack,
        ClusterArgs {
            name: config.cluster_name.clone(),
            account_id: config.account.clone(),
            region: config.region.clone(),
            kubernetes_version: config.kubernetes_version.clone(),
            subnet_ids,
        },
        collaborators,
        ResourceOptions::new(),
    )?;
    let after_cluster = || ResourceOptions::new().depends_on(&cluster.cluster);

    let generic_node_group = create_generic_node_group(
        stack,
        GENERIC_NODE_GROUP,
        cluster.cluster_name.clone(),
        private_subnet_ids.clone(),
        after_cluster(),
    )?;

    let node_groups = config
        .node_groups
        .iter()
        .map(|node_group| {
            create_open_node_group(
                stack,
                &node_group.name,
                &NodeGroupArgs::from_config(
                    node_group,
                    cluster.cluster_name.clone(),
                    private_subnet_ids.clone(),
                ),
                after_cluster(),
            )
        })
        .chain(config.preset_node_groups.iter().map(|preset| {
            create_open_node_group(
                stack,
                &preset.to_string(),
                &NodeGroupArgs::from_preset(
                    *preset,
                    cluster.cluster_name.clone(),
                    private_subnet_ids.clone(),
                ),
                after_cluster(),
            )
        }))
        .collect::<Result<Vec<_>>>()?;

    // Add-ons schedule onto nodes, so they wait for every node group.
    let node_group_resources: Vec<_> = std::iter::once(&generic_node_group)
        .chain(node_groups.iter())
        .map(|group| group.node_group.clone())
        .collect();
    let addon_options = || {
        ResourceOptions::new()
            .parent(&cluster.component)
            .depends_on_all(&node_group_resources)
    };

    let vpc_cni = create_vpc_cni(stack, VPC_CNI, &cluster, addon_options())?;
    let ebs_csi_driver = create_ebs_csi_driver(stack, EBS_CSI_DRIVER, &cluster, addon_options())?;
    let load_balancer_controller =
        create_load_balancer_controller(stack, LOAD_BALANCER_CONTROLLER, &cluster, addon_options())?;

    let autoscaler = match config.autoscaling {
        Autoscaling::None => Autoscaler::None,
        Autoscaling::ClusterAutoscaler => Autoscaler::ClusterAutoscaler(create_cluster_autoscaler(
            stack,
            CLUSTER_AUTOSCALER,
            &cluster,
            addon_options(),
        )?),
        Autoscaling::Karpenter => Autoscaler::Karpenter(Box::new(create_karpenter(
            stack,
            KARPENTER,
            &cluster,
            &config.region,
            private_subnet_ids.clone(),
            addon_options(),
        )?)),
    };

    let endpoints = create_endpoints(
        stack,
        VPC_ENDPOINTS,
        &EndpointArgs {
            region: config.region.clone(),
            vpc_id: Output::known(network.vpc_id.clone()),
            subnet_ids: private_subnet_ids,
            security_group_ids: cluster.security_group_id.map(|id| vec![id]),
            route_table_ids: Output::known(network.private_route_table_ids.clone()),
            interface_services: config.interface_endpoints.clone(),
            gateway_services: config.gateway_endpoints.clone(),
        },
        after_cluster(),
    )?;

    event!(
        Level::INFO,
        node_groups = node_groups.len() + 1,
        autoscaling = %config.autoscaling,
        "Declared platform."
    );
    Ok(Platform {
        cluster,
        generic_node_group,
        node_groups,
        vpc_cni,
        ebs_csi_driver,
        load_balancer_controller,
        autoscaler,
        endpoints,
    })
}
