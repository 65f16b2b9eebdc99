/*!
  External collaborators reached while the graph is being applied: the OIDC thumbprint lookup,
  the kubeconfig source and the load balancer controller installer.
!*/
mod eks;
pub mod error;
mod script;

pub use self::eks::EksKubeconfigSource;
pub use self::error::{CollaboratorError, CollaboratorResult, IntoCollaboratorError};
pub use self::script::{ScriptElbInstaller, ScriptKubeconfigSource, ScriptThumbprintFetcher};

use async_trait::async_trait;
use std::sync::Arc;

#[cfg(any(feature = "mockall", test))]
use mockall::{mock, predicate::*};

/// Length of a SHA-1 fingerprint in hex.
const THUMBPRINT_LENGTH: usize = 40;

#[async_trait]
/// Looks up the certificate thumbprint of a cluster's OIDC issuer.
pub trait ThumbprintFetcher: Send + Sync {
    /// Returns 40 lowercase hex characters.
    async fn thumbprint(&self, cluster_name: &str) -> CollaboratorResult<String>;
}

#[async_trait]
/// Produces a kubeconfig document for a cluster.
pub trait KubeconfigSource: Send + Sync {
    async fn kubeconfig(&self, region: &str, cluster_name: &str) -> CollaboratorResult<String>;
}

#[async_trait]
/// Installs the AWS Load Balancer Controller into a running cluster.
pub trait ElbInstaller: Send + Sync {
    async fn install(&self, cluster_name: &str) -> CollaboratorResult<()>;
}

#[cfg(any(feature = "mockall", test))]
mock! {
    /// A Mock ThumbprintFetcher for use in tests.
    pub ThumbprintFetcher {}
    #[async_trait]
    impl ThumbprintFetcher for ThumbprintFetcher {
        async fn thumbprint(&self, cluster_name: &str) -> CollaboratorResult<String>;
    }
}

#[cfg(any(feature = "mockall", test))]
mock! {
    /// A Mock KubeconfigSource for use in tests.
    pub KubeconfigSource {}
    #[async_trait]
    impl KubeconfigSource for KubeconfigSource {
        async fn kubeconfig(&self, region: &str, cluster_name: &str) -> CollaboratorResult<String>;
    }
}

#[cfg(any(feature = "mockall", test))]
mock! {
    /// A Mock ElbInstaller for use in tests.
    pub ElbInstaller {}
    #[async_trait]
    impl ElbInstaller for ElbInstaller {
        async fn install(&self, cluster_name: &str) -> CollaboratorResult<()>;
    }
}

/// A thumbprint pinned in configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KnownThumbprint {
    thumbprint: String,
}

impl KnownThumbprint {
    pub fn new(thumbprint: &str) -> CollaboratorResult<Self> {
        Ok(KnownThumbprint {
            thumbprint: normalize_thumbprint(thumbprint)?,
        })
    }
}

#[async_trait]
impl ThumbprintFetcher for KnownThumbprint {
    async fn thumbprint(&self, _cluster_name: &str) -> CollaboratorResult<String> {
        Ok(self.thumbprint.clone())
    }
}

/// Takes the first 40 characters of `raw`, lowercased, and checks that they are hex.
pub fn normalize_thumbprint(raw: &str) -> CollaboratorResult<String> {
    let raw = raw.trim();
    let thumbprint = raw
        .get(..THUMBPRINT_LENGTH)
        .context(format!(
            "Thumbprint '{}' is shorter than {} characters",
            raw, THUMBPRINT_LENGTH
        ))?
        .to_lowercase();
    hex::decode(&thumbprint).context(format!("Thumbprint '{}' is not hex", thumbprint))?;
    Ok(thumbprint)
}

/// The collaborators the composition reaches while resources are created.
#[derive(Clone)]
pub struct Collaborators {
    pub thumbprint: Arc<dyn ThumbprintFetcher>,
    /// When set, the cluster's kubeconfig is exported.
    pub kubeconfig: Option<Arc<dyn KubeconfigSource>>,
}

impl Collaborators {
    pub fn new(thumbprint: Arc<dyn ThumbprintFetcher>) -> Self {
        Collaborators {
            thumbprint,
            kubeconfig: None,
        }
    }

    pub fn with_kubeconfig(mut self, kubeconfig: Arc<dyn KubeconfigSource>) -> Self {
        self.kubeconfig = Some(kubeconfig);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THUMBPRINT: &str = "9E99A48A9960B14926BB7F3B02E22DA2B0AB7280";

    #[test]
    fn test_normalize_thumbprint() {
        assert_eq!(
            normalize_thumbprint(&format!("{}\n", THUMBPRINT)).unwrap(),
            THUMBPRINT.to_lowercase()
        );
        assert_eq!(
            normalize_thumbprint(&format!("{}trailing", THUMBPRINT)).unwrap(),
            THUMBPRINT.to_lowercase()
        );
        assert!(normalize_thumbprint("9e99a48a").is_err());
        assert!(normalize_thumbprint(&"z".repeat(40)).is_err());
    }

    #[tokio::test]
    async fn test_known_thumbprint() {
        let known = KnownThumbprint::new(THUMBPRINT).unwrap();
        assert_eq!(
            known.thumbprint("any-cluster").await.unwrap(),
            THUMBPRINT.to_lowercase()
        );
    }
}
