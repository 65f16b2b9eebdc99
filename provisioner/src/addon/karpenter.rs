//! Karpenter.
//!
//! Besides the controller's IRSA role this declares the interruption queue and the EventBridge
//! rules feeding it, the node role and instance profile Karpenter launches instances with, and a
//! bootstrap node group. The bootstrap group never runs nodes; declaring it registers the node
//! role in the cluster's IAM identity mapping so that Karpenter's instances can join.
use super::{InstalledAddon, Install, IrsaAddon};
use crate::cluster::PrincipalCluster;
use crate::error::{self, Result};
use crate::identity::{render_document, RoleConfig, TrustedServiceAccount};
use crate::nodegroup::{create_node_group, create_worker_role, NodeGroupArgs, BOOTSTRAP_SCALING};
use models::component_token;
use models::config::CapacityType;
use models::constants::KARPENTER_VERSION;
use models::graph::ResourceKind;
use models::output::Output;
use models::policy::karpenter::{
    controller_policy_name, instance_profile_name, interruption_queue_policy, node_role_name,
    ControllerPolicyParams, InterruptionRule,
};
use models::stack::{Resource, ResourceArgs, ResourceOptions, Stack};

use snafu::ResultExt;
use tracing::{event, instrument, Level};

use std::collections::BTreeMap;

pub const NAMESPACE: &str = "karpenter";
pub const SERVICE_ACCOUNT: &str = "karpenter";

pub const CONTROLLER_ROLE_ARN_EXPORT: &str = "KarpenterControllerRoleArn";
pub const NODE_ROLE_ARN_EXPORT: &str = "KarpenterNodeRoleArn";
pub const VERSION_EXPORT: &str = "KarpenterVersion";
pub const QUEUE_NAME_EXPORT: &str = "KarpenterQueueName";
pub const INSTANCE_PROFILE_NAME_EXPORT: &str = "KarpenterNodeInstanceProfileName";

const QUEUE_MESSAGE_RETENTION_SECONDS: u32 = 300;
const BOOTSTRAP_INSTANCE_TYPE: &str = "t2.micro";
const BOOTSTRAP_DISK_SIZE: u32 = 5;

/// An interruption rule and the target routing it to the queue.
#[derive(Clone, Debug)]
pub struct InterruptionRoute {
    pub rule: Resource,
    pub target: Resource,
}

/// Handles to everything Karpenter needs.
#[derive(Clone, Debug)]
pub struct Karpenter {
    pub controller: InstalledAddon,
    pub controller_policy: Resource,
    pub queue: Resource,
    pub queue_policy: Resource,
    pub routes: Vec<InterruptionRoute>,
    pub node_role: Resource,
    pub instance_profile: Resource,
    pub bootstrap_node_group: Resource,
}

/// Declares Karpenter's AWS resources for `cluster`. Bootstrap nodes would be placed in
/// `subnet_ids`.
#[instrument(skip_all, fields(addon = name))]
pub fn create_karpenter(
    stack: &Stack,
    name: &str,
    cluster: &PrincipalCluster,
    region: &str,
    subnet_ids: Output<Vec<String>>,
    options: ResourceOptions,
) -> Result<Karpenter> {
    let component = stack
        .register_component(component_token!("addon", "KarpenterAutoScaling"), name, options)
        .context(error::DeclareSnafu)?;
    let in_component = || ResourceOptions::new().parent(&component);

    let queue = stack
        .register(
            ResourceKind::SqsQueue,
            "KarpenterInterruptionQueue",
            ResourceArgs::new()
                .set_output("name", &cluster.cluster_name)
                .set("messageRetentionSeconds", QUEUE_MESSAGE_RETENTION_SECONDS)
                .set("sqsManagedSseEnabled", true),
            in_component(),
        )
        .context(error::DeclareSnafu)?;
    let queue_arn = queue.arn();

    let queue_policy = stack
        .register(
            ResourceKind::SqsQueuePolicy,
            "KarpenterInterruptionQueuePolicy",
            ResourceArgs::new()
                .set_output("queueUrl", &queue.string_output("url"))
                .set_output(
                    "policy",
                    &queue_arn.try_map(|arn| render_document(&interruption_queue_policy(&arn))),
                ),
            ResourceOptions::new().parent(&queue),
        )
        .context(error::DeclareSnafu)?;

    let mut routes = Vec::with_capacity(InterruptionRule::ALL.len());
    for interruption in InterruptionRule::ALL {
        let pattern = serde_json::to_string(&interruption.event_pattern()).map_err(|e| {
            error::Error::Assertion {
                message: format!(
                    "event pattern of '{}' does not serialize: {}",
                    interruption.logical_name(),
                    e
                ),
            }
        })?;
        let rule = stack
            .register(
                ResourceKind::EventRule,
                interruption.logical_name(),
                ResourceArgs::new().set("eventPattern", pattern),
                in_component(),
            )
            .context(error::DeclareSnafu)?;
        let target = stack
            .register(
                ResourceKind::EventTarget,
                format!("{}Target", interruption.logical_name()),
                ResourceArgs::new()
                    .set_output("arn", &queue_arn)
                    .set_output("rule", &rule.name()),
                ResourceOptions::new().parent(&rule),
            )
            .context(error::DeclareSnafu)?;
        routes.push(InterruptionRoute { rule, target });
    }

    let node_role = create_worker_role(
        stack,
        &format!("{}-node-role", name),
        RoleConfig::new()
            .named(node_role_name(&cluster.name))
            .path("/"),
        in_component(),
    )?;
    let instance_profile = stack
        .register(
            ResourceKind::IamInstanceProfile,
            "KarpenterNodeInstanceProfile",
            ResourceArgs::new()
                .set("name", instance_profile_name(&cluster.name))
                .set_output("role", &node_role.name())
                .set("path", "/"),
            in_component(),
        )
        .context(error::DeclareSnafu)?;

    let bootstrap = NodeGroupArgs {
        cluster_name: cluster.cluster_name.clone(),
        capacity_type: CapacityType::OnDemand,
        instance_types: vec![BOOTSTRAP_INSTANCE_TYPE.to_string()],
        scaling: BOOTSTRAP_SCALING,
        subnet_ids,
        ami_type: None,
        disk_size: Some(BOOTSTRAP_DISK_SIZE),
        labels: BTreeMap::new(),
        tags: BTreeMap::new(),
    };
    let bootstrap_node_group = create_node_group(
        stack,
        &format!("{}-bootstrap-node-group", name),
        &bootstrap,
        &node_role.arn(),
        in_component(),
    )?;

    let params_account = cluster.oidc.account_id.clone();
    let params_region = region.to_string();
    let params_cluster = cluster.name.clone();
    let controller_policy = stack
        .register(
            ResourceKind::IamPolicy,
            "KarpenterControllerPolicy",
            ResourceArgs::new()
                .set("name", controller_policy_name(&cluster.name))
                .set_output(
                    "policy",
                    &queue_arn.try_map(move |queue_arn| {
                        render_document(
                            &ControllerPolicyParams {
                                account_id: params_account,
                                region: params_region,
                                cluster_name: params_cluster,
                                queue_arn,
                            }
                            .document(),
                        )
                    }),
                ),
            in_component(),
        )
        .context(error::DeclareSnafu)?;

    let controller = IrsaAddon {
        name: format!("{}-controller", name),
        token: None,
        service_account: TrustedServiceAccount::new(NAMESPACE, SERVICE_ACCOUNT),
        permissions: RoleConfig::new().managed_policy_output(controller_policy.arn()),
        install: Install::External,
    }
    .install_under(stack, cluster, component.clone())?;

    for (key, value) in [
        (CONTROLLER_ROLE_ARN_EXPORT, controller.role.arn()),
        (NODE_ROLE_ARN_EXPORT, node_role.arn()),
        (VERSION_EXPORT, Output::known(KARPENTER_VERSION.to_string())),
        (QUEUE_NAME_EXPORT, queue.name()),
        (INSTANCE_PROFILE_NAME_EXPORT, instance_profile.name()),
    ] {
        stack.export(key, &value).context(error::DeclareSnafu)?;
    }
    event!(Level::INFO, rules = routes.len(), "Declared Karpenter.");

    Ok(Karpenter {
        controller,
        controller_policy,
        queue,
        queue_policy,
        routes,
        node_role,
        instance_profile,
        bootstrap_node_group,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{create_cluster, ClusterArgs};
    use crate::collaborators::{Collaborators, KnownThumbprint};
    use models::engine::PreviewEngine;
    use serde_json::{json, Value};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_queue_and_rules() {
        let stack = Stack::new(Arc::new(PreviewEngine::new("123456789012", "eu-west-1")));
        let cluster = create_cluster(
            &stack,
            ClusterArgs {
                name: "principal-cluster".to_string(),
                account_id: "123456789012".to_string(),
                region: "eu-west-1".to_string(),
                kubernetes_version: "1.27".to_string(),
                subnet_ids: Output::known(vec!["subnet-a".to_string()]),
            },
            &Collaborators::new(Arc::new(
                KnownThumbprint::new("9e99a48a9960b14926bb7f3b02e22da2b0ab7280").unwrap(),
            )),
            ResourceOptions::new(),
        )
        .unwrap();
        let karpenter = create_karpenter(
            &stack,
            "karpenter",
            &cluster,
            "eu-west-1",
            Output::known(vec!["subnet-a".to_string()]),
            ResourceOptions::new(),
        )
        .unwrap();
        stack.apply().await.unwrap();

        let queue = stack.declaration(karpenter.queue.id()).unwrap().unwrap();
        assert_eq!(queue.str_property("name"), Some("principal-cluster"));
        assert_eq!(queue.property("messageRetentionSeconds"), Some(&json!(300)));
        assert_eq!(queue.property("sqsManagedSseEnabled"), Some(&json!(true)));

        let queue_policy = stack
            .declaration(karpenter.queue_policy.id())
            .unwrap()
            .unwrap();
        assert_eq!(
            queue_policy.str_property("queueUrl"),
            Some("https://sqs.eu-west-1.amazonaws.com/123456789012/principal-cluster")
        );

        let rule_names: Vec<_> = karpenter
            .routes
            .iter()
            .map(|route| route.rule.id().name.clone())
            .collect();
        let expected: Vec<_> = InterruptionRule::ALL
            .iter()
            .map(|rule| rule.logical_name().to_string())
            .collect();
        assert_eq!(rule_names, expected);
        for route in &karpenter.routes {
            let rule = stack.declaration(route.rule.id()).unwrap().unwrap();
            // EventBridge takes the pattern as a JSON string.
            let pattern: Value =
                serde_json::from_str(rule.str_property("eventPattern").unwrap()).unwrap();
            assert!(pattern.get("source").is_some());
        }

        let controller_role = stack
            .declaration(karpenter.controller.role.id())
            .unwrap()
            .unwrap();
        assert_eq!(
            controller_role.property("managedPolicyArns"),
            Some(&json!([
                "arn:aws:iam::123456789012:policy/KarpenterControllerPolicy-principal-cluster"
            ]))
        );
        // The controller role lives in the Karpenter component rather than one of its own.
        assert_eq!(
            controller_role.parent.as_ref(),
            Some(karpenter.controller.component.id())
        );
        assert_eq!(karpenter.controller.component.id().name, "karpenter");
    }
}
