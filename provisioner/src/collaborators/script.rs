//! Collaborators backed by helper scripts.
use super::error::{CollaboratorError, CollaboratorResult, IntoCollaboratorError};
use super::{normalize_thumbprint, ElbInstaller, KubeconfigSource, ThumbprintFetcher};

use async_trait::async_trait;
use kube::config::Kubeconfig;
use tokio::process::Command;
use tracing::{event, instrument, Level};

use std::path::{Path, PathBuf};

const DEFAULT_THUMBPRINT_SCRIPT: &str = "./scripts/thumbprint.sh";
const DEFAULT_UPDATE_KUBECONFIG_SCRIPT: &str = "./scripts/update-kubeconfig.sh";
const DEFAULT_ELB_INSTALL_SCRIPT: &str = "./scripts/elb-addon-install.sh";

/// Runs `script` with `args` and returns its standard output. A non-zero exit is an error carrying
/// the script's standard error.
#[instrument(skip(args), fields(script = %script.display()))]
async fn run_script(script: &Path, args: &[&str]) -> CollaboratorResult<String> {
    let output = Command::new(script)
        .args(args)
        .output()
        .await
        .context(format!("Unable to run '{}'", script.display()))?;

    if !output.status.success() {
        return Err(CollaboratorError::new_with_context(format!(
            "'{}' failed with {}: {}",
            script.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    event!(Level::DEBUG, "Script completed.");

    String::from_utf8(output.stdout).context(format!(
        "'{}' wrote output that is not UTF-8",
        script.display()
    ))
}

/// Runs `<script> <cluster-name>` and reads the thumbprint from the first 40 characters it prints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScriptThumbprintFetcher {
    script: PathBuf,
}

impl ScriptThumbprintFetcher {
    pub fn new<P: Into<PathBuf>>(script: P) -> Self {
        ScriptThumbprintFetcher {
            script: script.into(),
        }
    }
}

impl Default for ScriptThumbprintFetcher {
    fn default() -> Self {
        Self::new(DEFAULT_THUMBPRINT_SCRIPT)
    }
}

#[async_trait]
impl ThumbprintFetcher for ScriptThumbprintFetcher {
    async fn thumbprint(&self, cluster_name: &str) -> CollaboratorResult<String> {
        let stdout = run_script(&self.script, &[cluster_name]).await?;
        normalize_thumbprint(&stdout)
    }
}

/// Runs `<script> <region> <cluster-name>`, which merges the cluster into a kubeconfig file, then
/// reads that file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScriptKubeconfigSource {
    script: PathBuf,
    kubeconfig_path: PathBuf,
}

impl ScriptKubeconfigSource {
    pub fn new<S, K>(script: S, kubeconfig_path: K) -> Self
    where
        S: Into<PathBuf>,
        K: Into<PathBuf>,
    {
        ScriptKubeconfigSource {
            script: script.into(),
            kubeconfig_path: kubeconfig_path.into(),
        }
    }

    /// Uses the default script and `$KUBECONFIG`, falling back to `$HOME/.kube/config`.
    pub fn from_env() -> CollaboratorResult<Self> {
        let kubeconfig_path = match std::env::var_os("KUBECONFIG") {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(
                std::env::var_os("HOME")
                    .context("Neither KUBECONFIG nor HOME is set; cannot locate the kubeconfig")?,
            )
            .join(".kube")
            .join("config"),
        };
        Ok(Self::new(DEFAULT_UPDATE_KUBECONFIG_SCRIPT, kubeconfig_path))
    }
}

#[async_trait]
impl KubeconfigSource for ScriptKubeconfigSource {
    async fn kubeconfig(&self, region: &str, cluster_name: &str) -> CollaboratorResult<String> {
        run_script(&self.script, &[region, cluster_name]).await?;
        let contents = tokio::fs::read_to_string(&self.kubeconfig_path)
            .await
            .context(format!(
                "Unable to read kubeconfig '{}'",
                self.kubeconfig_path.display()
            ))?;
        Kubeconfig::from_yaml(&contents).context(format!(
            "'{}' is not a valid kubeconfig",
            self.kubeconfig_path.display()
        ))?;
        Ok(contents)
    }
}

/// Runs `<script> <cluster-name>` to install the load balancer controller chart.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScriptElbInstaller {
    script: PathBuf,
}

impl ScriptElbInstaller {
    pub fn new<P: Into<PathBuf>>(script: P) -> Self {
        ScriptElbInstaller {
            script: script.into(),
        }
    }
}

impl Default for ScriptElbInstaller {
    fn default() -> Self {
        Self::new(DEFAULT_ELB_INSTALL_SCRIPT)
    }
}

#[async_trait]
impl ElbInstaller for ScriptElbInstaller {
    async fn install(&self, cluster_name: &str) -> CollaboratorResult<()> {
        let stdout = run_script(&self.script, &[cluster_name]).await?;
        event!(Level::INFO, cluster_name, output = %stdout.trim(), "Installed load balancer controller.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_thumbprint_script_output_is_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "thumbprint.sh",
            "echo 9E99A48A9960B14926BB7F3B02E22DA2B0AB7280",
        );

        let thumbprint = ScriptThumbprintFetcher::new(script)
            .thumbprint("principal-cluster")
            .await
            .unwrap();
        assert_eq!(thumbprint, "9e99a48a9960b14926bb7f3b02e22da2b0ab7280");
    }

    #[tokio::test]
    async fn test_failing_script_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "install.sh", "echo 'helm: not found' >&2; exit 3");

        let error = ScriptElbInstaller::new(script)
            .install("principal-cluster")
            .await
            .unwrap_err();
        assert!(error.to_string().contains("helm: not found"));
    }

    #[tokio::test]
    async fn test_missing_script_is_an_error() {
        let result = ScriptThumbprintFetcher::new("/nonexistent/thumbprint.sh")
            .thumbprint("principal-cluster")
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_kubeconfig_must_parse() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "update.sh", "exit 0");
        let kubeconfig = dir.path().join("config");
        std::fs::write(&kubeconfig, "clusters: [not, a, kubeconfig").unwrap();

        let result = ScriptKubeconfigSource::new(script, &kubeconfig)
            .kubeconfig("us-west-2", "principal-cluster")
            .await;
        assert!(result.is_err());
    }
}
