//! The boundary to the provisioning engine.
//!
//! The engine owns the actual cloud calls, ordering across declarations and retries. This crate
//! only hands it fully resolved declarations, one at a time, once everything a declaration waits
//! for has been created.
use crate::graph::{ResolvedDeclaration, ResourceKind};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use snafu::OptionExt;
use tracing::{event, instrument, Level};

use sha2::{Digest, Sha256};

use std::collections::BTreeMap;

#[cfg(any(feature = "mockall", test))]
use mockall::{mock, predicate::*};

/// What the engine reports back about a created resource.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    /// The physical identifier of the resource.
    pub id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, Value>,
}

impl ResourceState {
    pub fn new<S: Into<String>>(id: S) -> Self {
        ResourceState {
            id: id.into(),
            outputs: BTreeMap::new(),
        }
    }

    pub fn with_output<K: Into<String>>(mut self, key: K, value: Value) -> Self {
        self.outputs.insert(key.into(), value);
        self
    }
}

#[async_trait]
/// Creates resources on behalf of a `Stack`.
pub trait ProvisioningEngine: Send + Sync {
    async fn create(&self, declaration: &ResolvedDeclaration) -> Result<ResourceState>;
}

#[cfg(any(feature = "mockall", test))]
mock! {
    /// A Mock ProvisioningEngine for use in tests.
    pub ProvisioningEngine {}
    #[async_trait]
    impl ProvisioningEngine for ProvisioningEngine {
        async fn create(&self, declaration: &ResolvedDeclaration) -> Result<ResourceState>;
    }
}

/// An engine that never talks to a cloud API.
///
/// Identifiers are derived from the declaration alone, so declaring the same resources twice
/// yields the same ARNs, issuer URL and security group id. This backs `plan` and the tests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreviewEngine {
    account: String,
    region: String,
}

impl PreviewEngine {
    pub fn new<A, R>(account: A, region: R) -> Self
    where
        A: Into<String>,
        R: Into<String>,
    {
        PreviewEngine {
            account: account.into(),
            region: region.into(),
        }
    }

    /// The `name` property when the declaration pins one, otherwise the logical name.
    fn physical_name<'a>(&self, declaration: &'a ResolvedDeclaration) -> &'a str {
        declaration
            .str_property("name")
            .unwrap_or(&declaration.id.name)
    }

    fn required<'a>(
        &self,
        declaration: &'a ResolvedDeclaration,
        property: &str,
    ) -> Result<&'a str> {
        declaration
            .str_property(property)
            .context(engine_error::MissingPropertySnafu {
                resource: declaration.id.to_string(),
                property,
            })
    }

    fn iam_arn(&self, resource: &str) -> String {
        format!("arn:aws:iam::{}:{}", self.account, resource)
    }

    fn regional_arn(&self, service: &str, resource: &str) -> String {
        format!(
            "arn:aws:{}:{}:{}:{}",
            service, self.region, self.account, resource
        )
    }

    /// Digest of `parts` scoped to this engine's account and region.
    fn fingerprint(&self, parts: &[&str]) -> String {
        let scoped: Vec<&str> = [self.account.as_str(), self.region.as_str()]
            .into_iter()
            .chain(parts.iter().copied())
            .collect();
        fingerprint(&scoped)
    }

    fn describe(&self, declaration: &ResolvedDeclaration) -> Result<ResourceState> {
        let name = self.physical_name(declaration);
        let state = match &declaration.id.kind {
            ResourceKind::Component(_) => ResourceState::new(&declaration.id.name),
            ResourceKind::IamRole => {
                let path = declaration.str_property("path").unwrap_or("/");
                ResourceState::new(name)
                    .with_output("arn", json!(self.iam_arn(&format!("role{}{}", path, name))))
                    .with_output("name", json!(name))
            }
            ResourceKind::IamPolicy => {
                let arn = self.iam_arn(&format!("policy/{}", name));
                ResourceState::new(&arn)
                    .with_output("arn", json!(arn))
                    .with_output("name", json!(name))
            }
            ResourceKind::IamInstanceProfile => ResourceState::new(name)
                .with_output(
                    "arn",
                    json!(self.iam_arn(&format!("instance-profile/{}", name))),
                )
                .with_output("name", json!(name)),
            ResourceKind::IamOpenIdConnectProvider => {
                let url = self.required(declaration, "url")?;
                let host_and_path = url.split_once("://").map_or(url, |(_, rest)| rest);
                let arn = self.iam_arn(&format!("oidc-provider/{}", host_and_path));
                ResourceState::new(&arn)
                    .with_output("arn", json!(arn))
                    .with_output("url", json!(host_and_path))
            }
            ResourceKind::EksCluster => {
                let issuer_id = self.fingerprint(&[name, "issuer"])[..32].to_uppercase();
                let issuer = format!(
                    "https://oidc.eks.{}.amazonaws.com/id/{}",
                    self.region, issuer_id
                );
                let security_group = format!(
                    "sg-{}",
                    &self.fingerprint(&[name, "cluster-sg"])[..17]
                );
                let endpoint = format!(
                    "https://{}.gr7.{}.eks.amazonaws.com",
                    issuer_id, self.region
                );
                ResourceState::new(name)
                    .with_output("name", json!(name))
                    .with_output(
                        "arn",
                        json!(self.regional_arn("eks", &format!("cluster/{}", name))),
                    )
                    .with_output("endpoint", json!(endpoint))
                    .with_output(
                        "version",
                        declaration
                            .property("version")
                            .cloned()
                            .unwrap_or(Value::Null),
                    )
                    .with_output("identities", json!([{ "oidcs": [{ "issuer": issuer }] }]))
                    .with_output(
                        "vpcConfig",
                        json!({ "clusterSecurityGroupId": security_group }),
                    )
            }
            ResourceKind::EksNodeGroup => {
                let cluster = self.required(declaration, "clusterName")?;
                let suffix = self.fingerprint(&[cluster, name]);
                let suffix = &suffix[..32];
                ResourceState::new(format!("{}:{}", cluster, name))
                    .with_output("nodeGroupName", json!(name))
                    .with_output(
                        "arn",
                        json!(self.regional_arn(
                            "eks",
                            &format!("nodegroup/{}/{}/{}", cluster, name, suffix)
                        )),
                    )
            }
            ResourceKind::EksAddon => {
                let cluster = self.required(declaration, "clusterName")?;
                let addon = self.required(declaration, "addonName")?;
                ResourceState::new(format!("{}:{}", cluster, addon))
                    .with_output(
                        "arn",
                        json!(self.regional_arn("eks", &format!("addon/{}/{}", cluster, addon))),
                    )
                    .with_output(
                        "addonVersion",
                        declaration
                            .property("addonVersion")
                            .cloned()
                            .unwrap_or(Value::Null),
                    )
            }
            ResourceKind::Ec2Tag => {
                let resource = self.required(declaration, "resourceId")?;
                let key = self.required(declaration, "key")?;
                ResourceState::new(format!("{},{}", resource, key))
            }
            ResourceKind::Ec2VpcEndpoint => {
                let service = self.required(declaration, "serviceName")?;
                let id = format!(
                    "vpce-{}",
                    &self.fingerprint(&[service, name])[..17]
                );
                ResourceState::new(&id)
                    .with_output("id", json!(id))
                    .with_output(
                        "arn",
                        json!(self.regional_arn("ec2", &format!("vpc-endpoint/{}", id))),
                    )
            }
            ResourceKind::SqsQueue => {
                let url = format!(
                    "https://sqs.{}.amazonaws.com/{}/{}",
                    self.region, self.account, name
                );
                ResourceState::new(&url)
                    .with_output("arn", json!(self.regional_arn("sqs", name)))
                    .with_output("name", json!(name))
                    .with_output("url", json!(url))
            }
            ResourceKind::SqsQueuePolicy => {
                ResourceState::new(self.required(declaration, "queueUrl")?)
            }
            ResourceKind::EventRule => ResourceState::new(name)
                .with_output(
                    "arn",
                    json!(self.regional_arn("events", &format!("rule/{}", name))),
                )
                .with_output("name", json!(name)),
            ResourceKind::EventTarget => {
                let rule = self.required(declaration, "rule")?;
                ResourceState::new(format!("{}-{}", rule, declaration.id.name))
            }
            ResourceKind::KubernetesServiceAccount => {
                let namespace = declaration
                    .property("metadata")
                    .and_then(|metadata| metadata.get("namespace"))
                    .and_then(Value::as_str)
                    .unwrap_or("default");
                let account = declaration
                    .property("metadata")
                    .and_then(|metadata| metadata.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or(&declaration.id.name);
                ResourceState::new(format!("{}/{}", namespace, account))
            }
        };
        Ok(state)
    }
}

#[async_trait]
impl ProvisioningEngine for PreviewEngine {
    #[instrument(skip(self, declaration), fields(resource = %declaration.id))]
    async fn create(&self, declaration: &ResolvedDeclaration) -> Result<ResourceState> {
        let state = self.describe(declaration)?;
        event!(Level::DEBUG, id = %state.id, "Previewed resource.");
        Ok(state)
    }
}

/// A stable hex digest of `parts`: SHA-256 over the parts joined by `/`.
fn fingerprint(parts: &[&str]) -> String {
    hex::encode(Sha256::digest(parts.join("/").as_bytes()))
}

pub mod engine_error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Resource '{}' is missing required property '{}'", resource, property))]
        MissingProperty { resource: String, property: String },

        #[snafu(display("Resource '{}' was rejected: {}", resource, message))]
        Rejected { resource: String, message: String },
    }
}

pub type Result<T> = std::result::Result<T, engine_error::Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceId;
    use maplit::btreemap;

    fn declaration(
        kind: ResourceKind,
        name: &str,
        properties: BTreeMap<String, Value>,
    ) -> ResolvedDeclaration {
        ResolvedDeclaration {
            id: ResourceId::new(kind, name),
            parent: None,
            dependencies: Default::default(),
            properties,
        }
    }

    #[tokio::test]
    async fn test_cluster_identifiers_are_stable() {
        let engine = PreviewEngine::new("123456789012", "us-west-2");
        let cluster = declaration(
            ResourceKind::EksCluster,
            "cluster",
            btreemap! { "name".to_string() => json!("principal-cluster") },
        );

        let first = engine.create(&cluster).await.unwrap();
        let second = PreviewEngine::new("123456789012", "us-west-2")
            .create(&cluster)
            .await
            .unwrap();
        assert_eq!(first, second);

        let issuer = first.outputs["identities"][0]["oidcs"][0]["issuer"]
            .as_str()
            .unwrap();
        assert!(issuer.starts_with("https://oidc.eks.us-west-2.amazonaws.com/id/"));
        let security_group = first.outputs["vpcConfig"]["clusterSecurityGroupId"]
            .as_str()
            .unwrap();
        assert_eq!(security_group.len(), "sg-".len() + 17);
    }

    #[tokio::test]
    async fn test_cluster_identifiers_are_pinned_digests() {
        let cluster = declaration(
            ResourceKind::EksCluster,
            "cluster",
            btreemap! { "name".to_string() => json!("principal-cluster") },
        );
        let state = PreviewEngine::new("123456789012", "us-west-2")
            .create(&cluster)
            .await
            .unwrap();

        let issuer_digest =
            hex::encode(Sha256::digest(b"123456789012/us-west-2/principal-cluster/issuer"));
        assert_eq!(
            state.outputs["identities"][0]["oidcs"][0]["issuer"],
            json!(format!(
                "https://oidc.eks.us-west-2.amazonaws.com/id/{}",
                issuer_digest[..32].to_uppercase()
            ))
        );
        let sg_digest =
            hex::encode(Sha256::digest(b"123456789012/us-west-2/principal-cluster/cluster-sg"));
        assert_eq!(
            state.outputs["vpcConfig"]["clusterSecurityGroupId"],
            json!(format!("sg-{}", &sg_digest[..17]))
        );

        let other_account = PreviewEngine::new("210987654321", "us-west-2")
            .create(&cluster)
            .await
            .unwrap();
        assert_ne!(
            state.outputs["identities"],
            other_account.outputs["identities"]
        );
    }

    #[test]
    fn test_fingerprint_is_sha256_hex() {
        assert_eq!(
            fingerprint(&["abc"]),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(fingerprint(&["a", "b"]), fingerprint(&["a/b"]));
    }

    #[tokio::test]
    async fn test_role_and_queue_identifiers() {
        let engine = PreviewEngine::new("123456789012", "us-west-2");
        let role = engine
            .create(&declaration(
                ResourceKind::IamRole,
                "karpenter-node-role",
                btreemap! { "name".to_string() => json!("KarpenterNodeRole-demo") },
            ))
            .await
            .unwrap();
        assert_eq!(
            role.outputs["arn"],
            json!("arn:aws:iam::123456789012:role/KarpenterNodeRole-demo")
        );

        let queue = engine
            .create(&declaration(
                ResourceKind::SqsQueue,
                "karpenter-queue",
                btreemap! { "name".to_string() => json!("demo") },
            ))
            .await
            .unwrap();
        assert_eq!(
            queue.outputs["arn"],
            json!("arn:aws:sqs:us-west-2:123456789012:demo")
        );
        assert_eq!(
            queue.id,
            "https://sqs.us-west-2.amazonaws.com/123456789012/demo"
        );
    }

    #[tokio::test]
    async fn test_missing_property_is_rejected() {
        let engine = PreviewEngine::new("123456789012", "us-west-2");
        let result = engine
            .create(&declaration(ResourceKind::EksAddon, "vpc-cni", BTreeMap::new()))
            .await;
        assert!(matches!(
            result,
            Err(engine_error::Error::MissingProperty { .. })
        ));
    }
}
