//! Outputs of the network stack the cluster is placed in.
//!
//! The network stack is owned by another project. Its outputs are read through a
//! [`StackReference`], either from an outputs file written by that project or from SSM parameters
//! it publishes.
use models::constants::{
    NETWORK_PRIVATE_ROUTE_TABLES_OUTPUT, NETWORK_PRIVATE_SUBNETS_OUTPUT, NETWORK_SUBNETS_OUTPUT,
    NETWORK_VPC_ID_OUTPUT,
};

use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_sdk_ssm::Region;
use serde_json::Value;
use snafu::{OptionExt, ResultExt};
use tracing::{event, instrument, Level};

use std::collections::BTreeMap;
use std::path::PathBuf;

#[cfg(any(feature = "mockall", test))]
use mockall::{mock, predicate::*};

/// Reads outputs of another stack.
#[async_trait]
pub trait StackReference: Send + Sync {
    /// `<org>/<project>/<stack>`
    fn stack_path(&self) -> &str;

    async fn output(&self, name: &str) -> Result<Value>;
}

#[cfg(any(feature = "mockall", test))]
mock! {
    /// A Mock StackReference for use in tests.
    pub StackReference {}
    #[async_trait]
    impl StackReference for StackReference {
        fn stack_path(&self) -> &str;
        async fn output(&self, name: &str) -> Result<Value>;
    }
}

/// Reads `<state_dir>/<org>/<project>/<stack>.json`, a JSON object of output values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileStackReference {
    stack_path: String,
    path: PathBuf,
}

impl FileStackReference {
    pub fn new<P: Into<PathBuf>>(state_dir: P, stack_path: &str) -> Self {
        let path = state_dir.into().join(format!("{}.json", stack_path));
        FileStackReference {
            stack_path: stack_path.to_string(),
            path,
        }
    }

    async fn outputs(&self) -> Result<BTreeMap<String, Value>> {
        let contents = tokio::fs::read_to_string(&self.path).await.context(
            network_error::ReadOutputsSnafu {
                path: self.path.display().to_string(),
            },
        )?;
        serde_json::from_str(&contents).context(network_error::ParseOutputsSnafu {
            path: self.path.display().to_string(),
        })
    }
}

#[async_trait]
impl StackReference for FileStackReference {
    fn stack_path(&self) -> &str {
        &self.stack_path
    }

    async fn output(&self, name: &str) -> Result<Value> {
        self.outputs()
            .await?
            .remove(name)
            .context(network_error::MissingOutputSnafu {
                stack: &self.stack_path,
                name,
            })
    }
}

/// Reads the SSM parameter `/<org>/<project>/<stack>/<output>`.
///
/// Parameter values that parse as JSON are used as such; anything else is a plain string.
#[derive(Clone, Debug)]
pub struct SsmStackReference {
    stack_path: String,
    client: aws_sdk_ssm::Client,
}

impl SsmStackReference {
    pub async fn new(region: &str, stack_path: &str) -> Self {
        let region_provider =
            RegionProviderChain::first_try(Some(Region::new(region.to_string())));
        let shared_config = aws_config::from_env().region(region_provider).load().await;
        SsmStackReference {
            stack_path: stack_path.to_string(),
            client: aws_sdk_ssm::Client::new(&shared_config),
        }
    }

    pub fn parameter_name(&self, output: &str) -> String {
        format!("/{}/{}", self.stack_path, output)
    }
}

#[async_trait]
impl StackReference for SsmStackReference {
    fn stack_path(&self) -> &str {
        &self.stack_path
    }

    #[instrument(skip(self))]
    async fn output(&self, name: &str) -> Result<Value> {
        let parameter = self.parameter_name(name);
        let response = self
            .client
            .get_parameter()
            .name(&parameter)
            .send()
            .await
            .context(network_error::SsmSnafu {
                parameter: &parameter,
            })?;
        let value = response
            .parameter()
            .and_then(|parameter| parameter.value())
            .context(network_error::MissingOutputSnafu {
                stack: &self.stack_path,
                name,
            })?;
        Ok(serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string())))
    }
}

/// The network stack outputs a cluster needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkOutputs {
    /// Public and private subnets; the cluster's control plane uses all of them.
    pub subnet_ids: Vec<String>,
    pub private_subnet_ids: Vec<String>,
    pub private_route_table_ids: Vec<String>,
    pub vpc_id: String,
}

impl NetworkOutputs {
    #[instrument(skip(reference), fields(stack = reference.stack_path()))]
    pub async fn read(reference: &dyn StackReference) -> Result<Self> {
        let outputs = NetworkOutputs {
            subnet_ids: string_list(
                NETWORK_SUBNETS_OUTPUT,
                reference.output(NETWORK_SUBNETS_OUTPUT).await?,
            )?,
            private_subnet_ids: string_list(
                NETWORK_PRIVATE_SUBNETS_OUTPUT,
                reference.output(NETWORK_PRIVATE_SUBNETS_OUTPUT).await?,
            )?,
            private_route_table_ids: string_list(
                NETWORK_PRIVATE_ROUTE_TABLES_OUTPUT,
                reference.output(NETWORK_PRIVATE_ROUTE_TABLES_OUTPUT).await?,
            )?,
            vpc_id: match reference.output(NETWORK_VPC_ID_OUTPUT).await? {
                Value::String(vpc_id) => vpc_id,
                other => {
                    return network_error::InvalidOutputSnafu {
                        name: NETWORK_VPC_ID_OUTPUT,
                        message: format!("expected a string, found '{}'", other),
                    }
                    .fail()
                }
            },
        };
        event!(
            Level::INFO,
            subnets = outputs.subnet_ids.len(),
            vpc_id = %outputs.vpc_id,
            "Read network stack."
        );
        Ok(outputs)
    }
}

/// Accepts a JSON array of strings or a comma-separated string list.
fn string_list(name: &str, value: Value) -> Result<Vec<String>> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(item) => Ok(item),
                other => network_error::InvalidOutputSnafu {
                    name,
                    message: format!("expected a list of strings, found '{}'", other),
                }
                .fail(),
            })
            .collect(),
        Value::String(list) => Ok(list
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()),
        other => network_error::InvalidOutputSnafu {
            name,
            message: format!("expected a list of strings, found '{}'", other),
        }
        .fail(),
    }
}

pub type Result<T> = std::result::Result<T, network_error::Error>;

pub mod network_error {
    use aws_sdk_ssm::error::GetParameterError;
    use aws_sdk_ssm::types::SdkError;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to read stack outputs '{}': {}", path, source))]
        ReadOutputs {
            path: String,
            source: std::io::Error,
        },

        #[snafu(display("Unable to parse stack outputs '{}': {}", path, source))]
        ParseOutputs {
            path: String,
            source: serde_json::Error,
        },

        #[snafu(display("Stack '{}' has no output '{}'", stack, name))]
        MissingOutput { stack: String, name: String },

        #[snafu(display("Output '{}' is malformed: {}", name, message))]
        InvalidOutput { name: String, message: String },

        #[snafu(display("Unable to get SSM parameter '{}': {}", parameter, source))]
        Ssm {
            parameter: String,
            source: SdkError<GetParameterError>,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const OUTPUTS: &str = r#"{
        "Subnets": ["subnet-public-a", "subnet-private-a"],
        "PrivateSubnetIds": ["subnet-private-a"],
        "PrivateRouteTableIds": "rtb-1, rtb-2",
        "VpcId": "vpc-0123"
    }"#;

    #[tokio::test]
    async fn test_file_reference() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("acme/k8s-network")).unwrap();
        std::fs::write(dir.path().join("acme/k8s-network/dev.json"), OUTPUTS).unwrap();

        let reference = FileStackReference::new(dir.path(), "acme/k8s-network/dev");
        let outputs = NetworkOutputs::read(&reference).await.unwrap();
        assert_eq!(outputs.subnet_ids.len(), 2);
        assert_eq!(outputs.private_route_table_ids, vec!["rtb-1", "rtb-2"]);
        assert_eq!(outputs.vpc_id, "vpc-0123");

        assert!(matches!(
            reference.output("PublicSubnetIds").await,
            Err(network_error::Error::MissingOutput { .. })
        ));
    }

    #[tokio::test]
    async fn test_malformed_outputs_are_rejected() {
        let mut reference = MockStackReference::new();
        reference
            .expect_stack_path()
            .return_const("acme/k8s-network/dev".to_string());
        reference
            .expect_output()
            .with(eq(NETWORK_SUBNETS_OUTPUT))
            .returning(|_| Ok(json!([1, 2])));

        assert!(matches!(
            NetworkOutputs::read(&reference).await,
            Err(network_error::Error::InvalidOutput { .. })
        ));
    }
}
