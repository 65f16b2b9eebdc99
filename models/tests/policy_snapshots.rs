// Golden copies of the rendered policy documents. When a template changes on purpose, review the
// new rendering with `cargo insta review` before accepting it.
use models::policy::karpenter::{interruption_queue_policy, ControllerPolicyParams};
use models::policy::trust::IrsaTrust;

const ACCOUNT_ID: &str = "123456789012";
const REGION: &str = "us-west-2";
const CLUSTER_NAME: &str = "principal-cluster";
const ISSUER: &str = "oidc.eks.us-west-2.amazonaws.com/id/EXAMPLED539D4633E53DE1B71EXAMPLE";
const QUEUE_ARN: &str = "arn:aws:sqs:us-west-2:123456789012:principal-cluster";

#[test]
fn test_cluster_autoscaler_trust() {
    let trust = IrsaTrust {
        account_id: ACCOUNT_ID.to_string(),
        issuer: ISSUER.to_string(),
        namespace: "kube-system".to_string(),
        service_account: "cluster-autoscaler".to_string(),
    };
    let rendered = trust.document().render().unwrap();
    insta::assert_snapshot!("cluster_autoscaler_trust", rendered);
}

#[test]
fn test_karpenter_controller_policy() {
    let params = ControllerPolicyParams {
        account_id: ACCOUNT_ID.to_string(),
        region: REGION.to_string(),
        cluster_name: CLUSTER_NAME.to_string(),
        queue_arn: QUEUE_ARN.to_string(),
    };
    let rendered = params.document().render().unwrap();
    insta::assert_snapshot!("karpenter_controller_policy", rendered);
}

#[test]
fn test_interruption_queue_policy() {
    let rendered = interruption_queue_policy(QUEUE_ARN).render().unwrap();
    insta::assert_snapshot!("interruption_queue_policy", rendered);
}
