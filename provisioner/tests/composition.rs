use models::config::{StackConfig, StackConfigFile};
use models::engine::PreviewEngine;
use models::graph::ResourceKind;
use models::output::OutputError;
use models::policy::{OneOrMany, PolicyDocument};
use models::stack::{Resource, Stack};

use provisioner::addon::karpenter::{
    INSTANCE_PROFILE_NAME_EXPORT, NODE_ROLE_ARN_EXPORT, QUEUE_NAME_EXPORT, VERSION_EXPORT,
};
use provisioner::cluster::{CLUSTER_NAME_EXPORT, ISSUER_URL_EXPORT, ISSUER_URL_WITHOUT_PREFIX_EXPORT};
use provisioner::collaborators::{
    CollaboratorError, CollaboratorResult, Collaborators, KnownThumbprint, ThumbprintFetcher,
};
use provisioner::composition::{compose, Autoscaler, Platform};
use provisioner::network::NetworkOutputs;

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

const ACCOUNT: &str = "123456789012";
const REGION: &str = "us-west-2";
const THUMBPRINT: &str = "9e99a48a9960b14926bb7f3b02e22da2b0ab7280";

fn config(autoscaling: &str) -> StackConfig {
    config_with(autoscaling, "")
}

fn config_with(autoscaling: &str, extra: &str) -> StackConfig {
    StackConfigFile::from_yaml(&format!(
        r#"
account: "{}"
org: acme
stack: dev
region: {}
autoscaling: {}
{}
"#,
        ACCOUNT, REGION, autoscaling, extra
    ))
    .unwrap()
    .resolve()
    .unwrap()
}

fn network() -> NetworkOutputs {
    NetworkOutputs {
        subnet_ids: vec![
            "subnet-public-a".to_string(),
            "subnet-public-b".to_string(),
            "subnet-private-a".to_string(),
            "subnet-private-b".to_string(),
        ],
        private_subnet_ids: vec![
            "subnet-private-a".to_string(),
            "subnet-private-b".to_string(),
        ],
        private_route_table_ids: vec!["rtb-a".to_string(), "rtb-b".to_string()],
        vpc_id: "vpc-0123456789abcdef0".to_string(),
    }
}

fn collaborators() -> Collaborators {
    Collaborators::new(Arc::new(KnownThumbprint::new(THUMBPRINT).unwrap()))
}

fn declare(config: &StackConfig, collaborators: &Collaborators) -> (Stack, Platform) {
    let stack = Stack::new(Arc::new(PreviewEngine::new(ACCOUNT, REGION)));
    let platform = compose(&stack, &network(), collaborators, config).unwrap();
    (stack, platform)
}

/// Asserts that `role` trusts only `system:serviceaccount:<namespace>:<name>` through `issuer`.
fn assert_irsa_subject(stack: &Stack, role: &Resource, issuer: &str, namespace: &str, name: &str) {
    let declaration = stack.declaration(role.id()).unwrap().unwrap();
    let trust =
        PolicyDocument::parse(declaration.str_property("assumeRolePolicy").unwrap()).unwrap();
    assert_eq!(trust.statement.len(), 1);
    assert_eq!(
        trust.statement[0].condition_value("StringEquals", &format!("{}:sub", issuer)),
        Some(&OneOrMany::from(
            format!("system:serviceaccount:{}:{}", namespace, name).as_str()
        )),
        "{}",
        role.id()
    );
}

#[tokio::test]
async fn test_addon_roles_trust_their_service_accounts() {
    let (stack, platform) = declare(&config("cluster-autoscaler"), &collaborators());
    let outputs = stack.apply().await.unwrap();
    let issuer = outputs.exports[ISSUER_URL_WITHOUT_PREFIX_EXPORT]
        .as_str()
        .unwrap();

    let autoscaler = match &platform.autoscaler {
        Autoscaler::ClusterAutoscaler(addon) => addon,
        other => panic!("unexpected autoscaler {:?}", other),
    };
    for (addon, namespace, name) in [
        (&platform.vpc_cni, "kube-system", "aws-node"),
        (&platform.ebs_csi_driver, "kube-system", "ebs-csi-controller-sa"),
        (
            &platform.load_balancer_controller,
            "kube-system",
            "aws-load-balancer-controller",
        ),
        (autoscaler, "kube-system", "cluster-autoscaler"),
    ] {
        assert_irsa_subject(&stack, &addon.role, issuer, namespace, name);
        // Every IRSA role waits for the identity provider.
        assert!(stack
            .dependencies_of(addon.role.id())
            .unwrap()
            .contains(platform.cluster.oidc_provider().id()));
    }

    assert_eq!(
        stack
            .declarations_of(&ResourceKind::KubernetesServiceAccount)
            .unwrap()
            .len(),
        2
    );
    assert_eq!(
        stack.declarations_of(&ResourceKind::EksAddon).unwrap().len(),
        2
    );
    assert_eq!(outputs.exports["VpcCniVersion"], json!("v1.13.4-eksbuild.1"));
}

#[tokio::test]
async fn test_addons_wait_for_node_groups() {
    let (stack, platform) = declare(&config("none"), &collaborators());

    let node_group_dependencies = stack
        .dependencies_of(platform.generic_node_group.component.id())
        .unwrap();
    assert!(node_group_dependencies.contains(platform.cluster.cluster.id()));

    for addon in [
        &platform.vpc_cni,
        &platform.ebs_csi_driver,
        &platform.load_balancer_controller,
    ] {
        let dependencies = stack.dependencies_of(addon.component.id()).unwrap();
        assert!(dependencies.contains(platform.generic_node_group.node_group.id()));
        assert!(dependencies.contains(platform.cluster.component.id()));
    }

    assert!(matches!(platform.autoscaler, Autoscaler::None));
    stack.apply().await.unwrap();
    assert!(stack
        .declarations_of(&ResourceKind::SqsQueue)
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_preset_node_groups_are_composed() {
    let (stack, platform) = declare(
        &config_with("none", "preset_node_groups: [amd64-on-demand, amd64-spot]"),
        &collaborators(),
    );
    stack.apply().await.unwrap();

    assert_eq!(platform.node_groups.len(), 2);
    let mut capacity_types = Vec::new();
    for group in &platform.node_groups {
        let declaration = stack.declaration(group.node_group.id()).unwrap().unwrap();
        assert_eq!(declaration.str_property("amiType"), Some("AL2_x86_64"));
        assert_eq!(
            declaration.property("scalingConfig"),
            Some(&json!({ "minSize": 2, "desiredSize": 2, "maxSize": 6 }))
        );
        capacity_types.push(declaration.str_property("capacityType").unwrap().to_string());

        let dependencies = stack.dependencies_of(platform.vpc_cni.component.id()).unwrap();
        assert!(dependencies.contains(group.node_group.id()));
    }
    assert_eq!(capacity_types, vec!["ON_DEMAND", "SPOT"]);
    assert_eq!(platform.node_groups[0].node_group.id().name, "amd64-on-demand");
    assert_eq!(
        stack
            .declarations_of(&ResourceKind::EksNodeGroup)
            .unwrap()
            .len(),
        3
    );
}

#[tokio::test]
async fn test_karpenter_routes_interruptions_to_its_queue() {
    let (stack, platform) = declare(&config("karpenter"), &collaborators());
    let outputs = stack.apply().await.unwrap();
    let karpenter = match &platform.autoscaler {
        Autoscaler::Karpenter(karpenter) => karpenter,
        other => panic!("unexpected autoscaler {:?}", other),
    };

    let queue_arn = karpenter.queue.arn().resolve().await.unwrap();
    assert_eq!(
        queue_arn,
        format!("arn:aws:sqs:{}:{}:principal-cluster", REGION, ACCOUNT)
    );

    let policy = stack
        .declaration(karpenter.controller_policy.id())
        .unwrap()
        .unwrap();
    let document = policy.str_property("policy").unwrap();
    assert!(document.contains(&queue_arn));
    PolicyDocument::parse(document).unwrap();

    assert_eq!(karpenter.routes.len(), 4);
    for route in &karpenter.routes {
        let target = stack.declaration(route.target.id()).unwrap().unwrap();
        assert_eq!(target.str_property("arn"), Some(queue_arn.as_str()));
        assert_eq!(target.parent.as_ref(), Some(route.rule.id()));
    }

    let issuer = outputs.exports[ISSUER_URL_WITHOUT_PREFIX_EXPORT]
        .as_str()
        .unwrap();
    assert_irsa_subject(
        &stack,
        &karpenter.controller.role,
        issuer,
        "karpenter",
        "karpenter",
    );
    assert!(karpenter.controller.handle.is_none());

    let bootstrap = stack
        .declaration(karpenter.bootstrap_node_group.id())
        .unwrap()
        .unwrap();
    assert_eq!(
        bootstrap.property("scalingConfig"),
        Some(&json!({ "minSize": 0, "desiredSize": 0, "maxSize": 1 }))
    );

    assert_eq!(outputs.exports[VERSION_EXPORT], json!("v0.31.0"));
    assert_eq!(
        outputs.exports[QUEUE_NAME_EXPORT],
        json!("principal-cluster")
    );
    assert_eq!(
        outputs.exports[NODE_ROLE_ARN_EXPORT],
        json!(format!(
            "arn:aws:iam::{}:role/KarpenterNodeRole-principal-cluster",
            ACCOUNT
        ))
    );
    assert_eq!(
        outputs.exports[INSTANCE_PROFILE_NAME_EXPORT],
        json!("KarpenterNodeInstanceProfile-principal-cluster")
    );
}

#[tokio::test]
async fn test_default_endpoints() {
    let (stack, platform) = declare(&config("none"), &collaborators());
    stack.apply().await.unwrap();

    assert_eq!(platform.endpoints.interface_endpoints.len(), 7);
    assert_eq!(platform.endpoints.gateway_endpoints.len(), 1);

    let security_group = platform.cluster.security_group_id.resolve().await.unwrap();
    for endpoint in &platform.endpoints.interface_endpoints {
        let declaration = stack.declaration(endpoint.id()).unwrap().unwrap();
        assert_eq!(
            declaration.property("securityGroupIds"),
            Some(&json!([security_group]))
        );
        assert_eq!(
            declaration.property("subnetIds"),
            Some(&json!(["subnet-private-a", "subnet-private-b"]))
        );
    }
    let gateway = stack
        .declaration(platform.endpoints.gateway_endpoints[0].id())
        .unwrap()
        .unwrap();
    assert_eq!(
        gateway.property("routeTableIds"),
        Some(&json!(["rtb-a", "rtb-b"]))
    );
}

#[tokio::test]
async fn test_composition_is_repeatable() {
    let config = config("karpenter");
    let (first, _) = declare(&config, &collaborators());
    let (second, _) = declare(&config, &collaborators());
    let first = first.apply().await.unwrap();
    let second = second.apply().await.unwrap();

    assert_eq!(first.exports[ISSUER_URL_EXPORT], second.exports[ISSUER_URL_EXPORT]);
    assert_eq!(first.exports[CLUSTER_NAME_EXPORT], json!("principal-cluster"));
    assert_eq!(first.exports, second.exports);
    assert_eq!(first.resources.len(), second.resources.len());
}

struct UnreachableIssuer;

#[async_trait]
impl ThumbprintFetcher for UnreachableIssuer {
    async fn thumbprint(&self, _cluster_name: &str) -> CollaboratorResult<String> {
        Err(CollaboratorError::new_with_context(
            "thumbprint.sh: could not connect to the issuer",
        ))
    }
}

#[tokio::test]
async fn test_thumbprint_failure_fails_the_composition() {
    let (stack, _) = declare(
        &config("cluster-autoscaler"),
        &Collaborators::new(Arc::new(UnreachableIssuer)),
    );

    let error = stack.apply().await.unwrap_err();
    let root_causes = error.root_causes();
    assert!(!root_causes.is_empty());
    assert!(root_causes
        .iter()
        .all(|cause| matches!(cause, OutputError::Collaborator { .. })));
}
