use super::error::{CollaboratorResult, IntoCollaboratorError};
use super::KubeconfigSource;

use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_sdk_eks::Region;
use kube::config::Kubeconfig;
use serde_json::json;
use tracing::{event, instrument, Level};

/// Builds a kubeconfig from the cluster's `DescribeCluster` response. Credentials are obtained at
/// use time through `aws eks get-token`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EksKubeconfigSource {}

impl EksKubeconfigSource {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KubeconfigSource for EksKubeconfigSource {
    #[instrument(skip(self))]
    async fn kubeconfig(&self, region: &str, cluster_name: &str) -> CollaboratorResult<String> {
        let region_provider =
            RegionProviderChain::first_try(Some(Region::new(region.to_string())));
        let shared_config = aws_config::from_env().region(region_provider).load().await;
        let eks_client = aws_sdk_eks::Client::new(&shared_config);

        let describe_results = eks_client
            .describe_cluster()
            .name(cluster_name)
            .send()
            .await
            .context("Unable to get eks describe cluster")?;
        let cluster = describe_results
            .cluster()
            .context("Results missing cluster field")?;
        let endpoint = cluster
            .endpoint()
            .context("Cluster missing endpoint field")?;
        let certificate = cluster
            .certificate_authority()
            .and_then(|authority| authority.data())
            .context("Cluster missing certificate authority data")?;
        event!(Level::DEBUG, endpoint, "Described cluster.");

        render_kubeconfig(region, cluster_name, endpoint, certificate)
    }
}

/// Renders a single-context kubeconfig and checks that it parses.
pub(crate) fn render_kubeconfig(
    region: &str,
    cluster_name: &str,
    endpoint: &str,
    certificate: &str,
) -> CollaboratorResult<String> {
    let kubeconfig = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": cluster_name,
            "cluster": {
                "server": endpoint,
                "certificate-authority-data": certificate,
            },
        }],
        "contexts": [{
            "name": cluster_name,
            "context": {
                "cluster": cluster_name,
                "user": cluster_name,
            },
        }],
        "current-context": cluster_name,
        "preferences": {},
        "users": [{
            "name": cluster_name,
            "user": {
                "exec": {
                    "apiVersion": "client.authentication.k8s.io/v1beta1",
                    "command": "aws",
                    "args": [
                        "--region", region,
                        "eks", "get-token",
                        "--cluster-name", cluster_name,
                    ],
                },
            },
        }],
    });

    let rendered = serde_yaml::to_string(&kubeconfig).context("Unable to render kubeconfig")?;
    Kubeconfig::from_yaml(&rendered).context("Rendered kubeconfig does not parse")?;
    Ok(rendered)
}
