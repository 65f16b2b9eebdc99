/// Helper macro to avoid retyping the prefix of AWS managed policy ARNs. When given no parameters,
/// this returns the prefix itself. When given a string literal parameter it appends the parameter
/// to the prefix.
#[macro_export]
macro_rules! aws_managed_policy {
    () => {
        "arn:aws:iam::aws:policy/"
    };
    ($s:literal) => {
        concat!($crate::aws_managed_policy!(), $s)
    };
}

/// Component type tokens use `<package>:<module>:<type>`.
#[macro_export]
macro_rules! component_token {
    ($module:literal, $type:literal) => {
        concat!("eks-platform:", $module, ":", $type)
    };
}

pub const IAM_POLICY_VERSION: &str = "2012-10-17";

// Service principals
pub const EKS_SERVICE_PRINCIPAL: &str = "eks.amazonaws.com";
pub const EC2_SERVICE_PRINCIPAL: &str = "ec2.amazonaws.com";
pub const EVENTS_SERVICE_PRINCIPAL: &str = "events.amazonaws.com";
pub const SQS_SERVICE_PRINCIPAL: &str = "sqs.amazonaws.com";
pub const STS_AUDIENCE: &str = "sts.amazonaws.com";

// Managed policies
pub const EKS_CLUSTER_POLICY_ARN: &str = aws_managed_policy!("AmazonEKSClusterPolicy");
pub const EKS_WORKER_NODE_POLICY_ARN: &str = aws_managed_policy!("AmazonEKSWorkerNodePolicy");
pub const EKS_CNI_POLICY_ARN: &str = aws_managed_policy!("AmazonEKS_CNI_Policy");
pub const EC2_CONTAINER_REGISTRY_READ_ONLY_ARN: &str =
    aws_managed_policy!("AmazonEC2ContainerRegistryReadOnly");
pub const SSM_MANAGED_INSTANCE_CORE_ARN: &str = aws_managed_policy!("AmazonSSMManagedInstanceCore");
pub const EBS_CSI_DRIVER_POLICY_ARN: &str =
    aws_managed_policy!("service-role/AmazonEBSCSIDriverPolicy");

/// Every worker role (generic, open and Karpenter nodes) carries exactly these policies.
pub const WORKER_NODE_POLICY_ARNS: [&str; 4] = [
    SSM_MANAGED_INSTANCE_CORE_ARN,
    EC2_CONTAINER_REGISTRY_READ_ONLY_ARN,
    EKS_CNI_POLICY_ARN,
    EKS_WORKER_NODE_POLICY_ARN,
];

// Tag and annotation keys
pub const KARPENTER_DISCOVERY_TAG: &str = "karpenter.sh/discovery";
pub const KARPENTER_PROVISIONER_NAME_TAG: &str = "karpenter.sh/provisioner-name";
pub const KARPENTER_MANAGED_BY_TAG: &str = "karpenter.sh/managed-by";
pub const CLUSTER_OWNED_TAG_VALUE: &str = "owned";
pub const ROLE_ARN_ANNOTATION: &str = "eks.amazonaws.com/role-arn";
pub const STS_REGIONAL_ENDPOINTS_ANNOTATION: &str = "eks.amazonaws.com/sts-regional-endpoints";

// Standard labels https://kubernetes.io/docs/concepts/overview/working-with-objects/common-labels/
pub const APP_NAME: &str = "app.kubernetes.io/name";
pub const APP_COMPONENT: &str = "app.kubernetes.io/component";

pub const KUBE_SYSTEM_NAMESPACE: &str = "kube-system";

/// `kubernetes.io/cluster/<name>`, the ownership tag key the cloud controllers look for.
pub fn cluster_ownership_tag(cluster_name: &str) -> String {
    format!("kubernetes.io/cluster/{}", cluster_name)
}

// Cluster defaults
pub const DEFAULT_CLUSTER_NAME: &str = "principal-cluster";
pub const DEFAULT_KUBERNETES_VERSION: &str = "1.27";
pub const DEFAULT_NETWORK_PROJECT: &str = "k8s-network";

// Add-on versions
pub const VPC_CNI_ADDON_VERSION: &str = "v1.13.4-eksbuild.1";
pub const KARPENTER_VERSION: &str = "v0.31.0";

// Network stack output names
pub const NETWORK_SUBNETS_OUTPUT: &str = "Subnets";
pub const NETWORK_PRIVATE_SUBNETS_OUTPUT: &str = "PrivateSubnetIds";
pub const NETWORK_PRIVATE_ROUTE_TABLES_OUTPUT: &str = "PrivateRouteTableIds";
pub const NETWORK_VPC_ID_OUTPUT: &str = "VpcId";

// VPC endpoint services
pub const DEFAULT_INTERFACE_ENDPOINT_SERVICES: [&str; 7] = [
    "ecr.api",
    "ecr.dkr",
    "sts",
    "ssm",
    "ec2messages",
    "ssmmessages",
    "ec2",
];
pub const DEFAULT_GATEWAY_ENDPOINT_SERVICES: [&str; 1] = ["s3"];
