//! Policies and event patterns for Karpenter's controller and its interruption queue.
use super::{PolicyDocument, Statement};
use crate::constants::{
    cluster_ownership_tag, CLUSTER_OWNED_TAG_VALUE, EC2_SERVICE_PRINCIPAL,
    EVENTS_SERVICE_PRINCIPAL, KARPENTER_MANAGED_BY_TAG, KARPENTER_PROVISIONER_NAME_TAG,
    SQS_SERVICE_PRINCIPAL,
};

use serde::{Deserialize, Serialize};

pub const INTERRUPTION_QUEUE_POLICY_ID: &str = "EC2InterruptionPolicy";
pub const INTERRUPTION_QUEUE_STATEMENT_ID: &str = "Stmt1695685506485";

/// `KarpenterNodeRole-<cluster>`
pub fn node_role_name(cluster_name: &str) -> String {
    format!("KarpenterNodeRole-{}", cluster_name)
}

/// `KarpenterNodeInstanceProfile-<cluster>`
pub fn instance_profile_name(cluster_name: &str) -> String {
    format!("KarpenterNodeInstanceProfile-{}", cluster_name)
}

/// `KarpenterControllerPolicy-<cluster>`
pub fn controller_policy_name(cluster_name: &str) -> String {
    format!("KarpenterControllerPolicy-{}", cluster_name)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerPolicyParams {
    pub account_id: String,
    pub region: String,
    pub cluster_name: String,
    pub queue_arn: String,
}

impl ControllerPolicyParams {
    fn ec2_arn(&self, resource: &str) -> String {
        format!("arn:aws:ec2:{}:*:{}", self.region, resource)
    }

    fn ec2_arns(&self, resources: &[&str]) -> Vec<String> {
        resources.iter().map(|r| self.ec2_arn(r)).collect()
    }

    fn request_tag(tag: &str) -> String {
        format!("aws:RequestTag/{}", tag)
    }

    fn resource_tag(tag: &str) -> String {
        format!("aws:ResourceTag/{}", tag)
    }

    /// The policy attached to the controller's IRSA role.
    ///
    /// Instance and launch template actions are scoped to resources tagged as owned by the
    /// cluster and by a Karpenter provisioner.
    pub fn document(&self) -> PolicyDocument {
        let ownership = cluster_ownership_tag(&self.cluster_name);
        let launch_actions = ["ec2:RunInstances", "ec2:CreateFleet"];
        let tagged_resources = [
            "fleet/*",
            "instance/*",
            "volume/*",
            "network-interface/*",
        ];

        let mut tagging_resources = tagged_resources.to_vec();
        tagging_resources.push("launch-template/*");

        let mut scoped_resources = vec![
            format!("arn:aws:ec2:{}::image/*", self.region),
            format!("arn:aws:ec2:{}::snapshot/*", self.region),
        ];
        scoped_resources.extend(self.ec2_arns(&[
            "spot-instances-request/*",
            "security-group/*",
            "subnet/*",
            "launch-template/*",
        ]));

        PolicyDocument::new(vec![
            Statement::allow(&launch_actions[..])
                .sid("AllowScopedEC2InstanceActions")
                .resource(scoped_resources),
            Statement::allow("ec2:CreateLaunchTemplate")
                .sid("AllowScopedEC2LaunchTemplateActions")
                .resource(self.ec2_arn("launch-template/*"))
                .condition(
                    "StringEquals",
                    Self::request_tag(&ownership),
                    CLUSTER_OWNED_TAG_VALUE,
                )
                .condition(
                    "StringLike",
                    Self::request_tag(KARPENTER_PROVISIONER_NAME_TAG),
                    "*",
                ),
            Statement::allow(&launch_actions[..])
                .sid("AllowScopedEC2InstanceActionsWithTags")
                .resource(self.ec2_arns(&tagged_resources))
                .condition(
                    "StringEquals",
                    Self::request_tag(&ownership),
                    CLUSTER_OWNED_TAG_VALUE,
                )
                .condition(
                    "StringLike",
                    Self::request_tag(KARPENTER_PROVISIONER_NAME_TAG),
                    "*",
                ),
            Statement::allow("ec2:CreateTags")
                .sid("AllowScopedResourceCreationTagging")
                .resource(self.ec2_arns(&tagging_resources))
                .condition(
                    "StringEquals",
                    Self::request_tag(&ownership),
                    CLUSTER_OWNED_TAG_VALUE,
                )
                .condition(
                    "StringEquals",
                    "ec2:CreateAction",
                    &["RunInstances", "CreateFleet", "CreateLaunchTemplate"][..],
                )
                .condition(
                    "StringLike",
                    Self::request_tag(KARPENTER_PROVISIONER_NAME_TAG),
                    "*",
                ),
            Statement::allow("ec2:CreateTags")
                .sid("AllowMachineMigrationTagging")
                .resource(self.ec2_arn("instance/*"))
                .condition(
                    "StringEquals",
                    Self::resource_tag(&ownership),
                    CLUSTER_OWNED_TAG_VALUE,
                )
                .condition(
                    "StringEquals",
                    Self::request_tag(KARPENTER_MANAGED_BY_TAG),
                    self.cluster_name.as_str(),
                )
                .condition(
                    "StringLike",
                    Self::request_tag(KARPENTER_PROVISIONER_NAME_TAG),
                    "*",
                )
                .condition(
                    "ForAllValues:StringEquals",
                    "aws:TagKeys",
                    &[KARPENTER_PROVISIONER_NAME_TAG, KARPENTER_MANAGED_BY_TAG][..],
                ),
            Statement::allow(&["ec2:TerminateInstances", "ec2:DeleteLaunchTemplate"][..])
                .sid("AllowScopedDeletion")
                .resource(self.ec2_arns(&["instance/*", "launch-template/*"]))
                .condition(
                    "StringEquals",
                    Self::resource_tag(&ownership),
                    CLUSTER_OWNED_TAG_VALUE,
                )
                .condition(
                    "StringLike",
                    Self::resource_tag(KARPENTER_PROVISIONER_NAME_TAG),
                    "*",
                ),
            Statement::allow(
                &[
                    "ec2:DescribeAvailabilityZones",
                    "ec2:DescribeImages",
                    "ec2:DescribeInstances",
                    "ec2:DescribeInstanceTypeOfferings",
                    "ec2:DescribeInstanceTypes",
                    "ec2:DescribeLaunchTemplates",
                    "ec2:DescribeSecurityGroups",
                    "ec2:DescribeSpotPriceHistory",
                    "ec2:DescribeSubnets",
                ][..],
            )
            .sid("AllowRegionalReadActions")
            .resource("*")
            .condition(
                "StringEquals",
                "aws:RequestedRegion",
                self.region.as_str(),
            ),
            Statement::allow(&["pricing:GetProducts", "ssm:GetParameter"][..])
                .sid("AllowGlobalReadActions")
                .resource("*"),
            Statement::allow(
                &[
                    "sqs:DeleteMessage",
                    "sqs:GetQueueAttributes",
                    "sqs:GetQueueUrl",
                    "sqs:ReceiveMessage",
                ][..],
            )
            .sid("AllowInterruptionQueueActions")
            .resource(self.queue_arn.as_str()),
            Statement::allow("iam:PassRole")
                .sid("AllowPassingInstanceRole")
                .resource(format!(
                    "arn:aws:iam::{}:role/{}",
                    self.account_id,
                    node_role_name(&self.cluster_name)
                ))
                .condition(
                    "StringEquals",
                    "iam:PassedToService",
                    EC2_SERVICE_PRINCIPAL,
                ),
            Statement::allow("eks:DescribeCluster")
                .sid("AllowAPIServerEndpointDiscovery")
                .resource(format!(
                    "arn:aws:eks:{}:{}:cluster/{}",
                    self.region, self.account_id, self.cluster_name
                )),
        ])
    }
}

/// Lets EventBridge and SQS deliver interruption events to the queue.
pub fn interruption_queue_policy(queue_arn: &str) -> PolicyDocument {
    PolicyDocument::new(vec![Statement::allow(&["sqs:SendMessage"][..])
        .sid(INTERRUPTION_QUEUE_STATEMENT_ID)
        .resource(queue_arn)
        .service_principal(&[EVENTS_SERVICE_PRINCIPAL, SQS_SERVICE_PRINCIPAL][..])])
    .with_id(INTERRUPTION_QUEUE_POLICY_ID)
}

/// An EventBridge pattern matching one event source and detail type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPattern {
    pub source: Vec<String>,
    #[serde(rename = "detail-type")]
    pub detail_type: Vec<String>,
}

/// The events Karpenter reacts to ahead of a node going away.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InterruptionRule {
    ScheduledChange,
    SpotInterruption,
    Rebalance,
    InstanceStateChange,
}

impl InterruptionRule {
    pub const ALL: [InterruptionRule; 4] = [
        InterruptionRule::ScheduledChange,
        InterruptionRule::SpotInterruption,
        InterruptionRule::Rebalance,
        InterruptionRule::InstanceStateChange,
    ];

    pub fn logical_name(&self) -> &'static str {
        match self {
            InterruptionRule::ScheduledChange => "ScheduledChangeRule",
            InterruptionRule::SpotInterruption => "SpotInterruptionRule",
            InterruptionRule::Rebalance => "RebalanceRule",
            InterruptionRule::InstanceStateChange => "InstanceStateChangeRule",
        }
    }

    fn source(&self) -> &'static str {
        match self {
            InterruptionRule::ScheduledChange => "aws.health",
            _ => "aws.ec2",
        }
    }

    fn detail_type(&self) -> &'static str {
        match self {
            InterruptionRule::ScheduledChange => "AWS Health Event",
            InterruptionRule::SpotInterruption => "EC2 Spot Instance Interruption Warning",
            InterruptionRule::Rebalance => "EC2 Instance Rebalance Recommendation",
            InterruptionRule::InstanceStateChange => "EC2 Instance State-change Notification",
        }
    }

    pub fn event_pattern(&self) -> EventPattern {
        EventPattern {
            source: vec![self.source().to_string()],
            detail_type: vec![self.detail_type().to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::OneOrMany;

    fn params() -> ControllerPolicyParams {
        ControllerPolicyParams {
            account_id: "123456789012".to_string(),
            region: "us-west-2".to_string(),
            cluster_name: "principal-cluster".to_string(),
            queue_arn: "arn:aws:sqs:us-west-2:123456789012:principal-cluster".to_string(),
        }
    }

    #[test]
    fn test_controller_policy_references_queue_and_node_role() {
        let document = params().document();
        assert_eq!(document.statement.len(), 11);

        let queue = document
            .statement_by_sid("AllowInterruptionQueueActions")
            .unwrap();
        assert_eq!(
            queue.resource,
            Some(OneOrMany::from(
                "arn:aws:sqs:us-west-2:123456789012:principal-cluster"
            ))
        );

        let pass_role = document.statement_by_sid("AllowPassingInstanceRole").unwrap();
        assert_eq!(
            pass_role.resource,
            Some(OneOrMany::from(
                "arn:aws:iam::123456789012:role/KarpenterNodeRole-principal-cluster"
            ))
        );
    }

    #[test]
    fn test_scoped_statements_require_cluster_ownership() {
        let document = params().document();
        let deletion = document.statement_by_sid("AllowScopedDeletion").unwrap();
        assert_eq!(
            deletion.condition_value(
                "StringEquals",
                "aws:ResourceTag/kubernetes.io/cluster/principal-cluster"
            ),
            Some(&OneOrMany::from("owned"))
        );
    }

    #[test]
    fn test_event_patterns() {
        let patterns: Vec<_> = InterruptionRule::ALL
            .iter()
            .map(|rule| serde_json::to_value(rule.event_pattern()).unwrap())
            .collect();
        assert_eq!(
            patterns[0],
            serde_json::json!({"source": ["aws.health"], "detail-type": ["AWS Health Event"]})
        );
        assert!(patterns[1..]
            .iter()
            .all(|pattern| pattern["source"] == serde_json::json!(["aws.ec2"])));
    }
}
