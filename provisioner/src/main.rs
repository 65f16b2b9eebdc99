use models::config::StackConfig;
use models::engine::PreviewEngine;
use models::stack::Stack;
use models::telemetry::init_telemetry_from_env;

use provisioner::addon::elb::install_controller;
use provisioner::collaborators::{
    Collaborators, EksKubeconfigSource, KnownThumbprint, KubeconfigSource, ScriptElbInstaller,
    ScriptKubeconfigSource, ScriptThumbprintFetcher, ThumbprintFetcher,
};
use provisioner::composition::compose;
use provisioner::network::{FileStackReference, NetworkOutputs, SsmStackReference, StackReference};

use snafu::ResultExt;
use structopt::StructOpt;
use tracing::{event, Level};

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

type Result<T> = std::result::Result<T, error::Error>;

/// Where network stack outputs are read from when `--ssm` is not given.
const DEFAULT_STATE_DIR: &str = ".stacks";

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{}", e);
        process::exit(1);
    }
}

#[derive(StructOpt, Debug)]
#[structopt(about = "Declares an EKS cluster and its ecosystem")]
pub(crate) struct Arguments {
    /// YAML stack configuration. Environment variables override its settings.
    #[structopt(global = true, long = "--config", parse(from_os_str))]
    config: Option<PathBuf>,

    /// Directory holding `<org>/<project>/<stack>.json` outputs of referenced stacks.
    #[structopt(
        global = true,
        long = "--state-dir",
        default_value = DEFAULT_STATE_DIR,
        parse(from_os_str)
    )]
    state_dir: PathBuf,

    /// Read the network stack's outputs from SSM parameters instead of the state directory.
    #[structopt(global = true, long = "--ssm")]
    ssm: bool,

    /// Render the kubeconfig from DescribeCluster instead of running the update script.
    #[structopt(global = true, long = "--kubeconfig-from-api")]
    kubeconfig_from_api: bool,

    #[structopt(subcommand)]
    subcommand: SubCommand,
}

#[derive(StructOpt, Debug)]
enum SubCommand {
    /// Resolve the platform and print the created resources and exports as YAML.
    Plan,
    /// Resolve the platform and print resources in dependency order.
    Graph,
    /// Run steps that need a running cluster.
    PostProvision,
}

async fn run() -> Result<()> {
    init_telemetry_from_env().context(error::TelemetrySnafu)?;

    let args = Arguments::from_args();
    let config = StackConfig::load(args.config.as_deref())
        .context(provisioner::error::ConfigSnafu)
        .context(error::ProvisionSnafu)?;
    event!(
        Level::INFO,
        org = %config.org,
        stack = %config.stack,
        region = %config.region,
        "Loaded configuration."
    );

    match &args.subcommand {
        SubCommand::Plan => {
            let stack = declare(&args, &config).await?;
            let outputs = stack.apply().await.context(error::ApplySnafu)?;
            print!(
                "{}",
                serde_yaml::to_string(&outputs).context(error::SerializeSnafu)?
            );
        }
        SubCommand::Graph => {
            let stack = declare(&args, &config).await?;
            stack.apply().await.context(error::ApplySnafu)?;
            for id in stack.topological_order().context(error::ApplySnafu)? {
                let dependencies = stack.dependencies_of(&id).context(error::ApplySnafu)?;
                if dependencies.is_empty() {
                    println!("{}", id);
                } else {
                    let dependencies: Vec<_> = dependencies.iter().map(ToString::to_string).collect();
                    println!("{} <- {}", id, dependencies.join(", "));
                }
            }
        }
        SubCommand::PostProvision => {
            install_controller(&ScriptElbInstaller::default(), &config.cluster_name)
                .await
                .context(error::ProvisionSnafu)?;
        }
    }
    Ok(())
}

/// Reads the network stack and declares the platform into a fresh stack.
async fn declare(args: &Arguments, config: &StackConfig) -> Result<Stack> {
    let stack_path = config.network_stack_path();
    let reference: Box<dyn StackReference> = if args.ssm {
        Box::new(SsmStackReference::new(&config.region, &stack_path).await)
    } else {
        Box::new(FileStackReference::new(&args.state_dir, &stack_path))
    };
    let network = NetworkOutputs::read(reference.as_ref())
        .await
        .context(provisioner::error::NetworkStackSnafu)
        .context(error::ProvisionSnafu)?;

    let collaborators = collaborators(args, config).context(error::ProvisionSnafu)?;
    let stack = Stack::new(Arc::new(PreviewEngine::new(
        config.account.clone(),
        config.region.clone(),
    )));
    compose(&stack, &network, &collaborators, config).context(error::ProvisionSnafu)?;
    Ok(stack)
}

fn collaborators(args: &Arguments, config: &StackConfig) -> provisioner::Result<Collaborators> {
    let thumbprint: Arc<dyn ThumbprintFetcher> = match &config.thumbprint {
        Some(thumbprint) => Arc::new(
            KnownThumbprint::new(thumbprint).context(provisioner::error::CollaboratorSetupSnafu)?,
        ),
        None => Arc::new(ScriptThumbprintFetcher::default()),
    };
    let collaborators = Collaborators::new(thumbprint);
    if !config.export_kubeconfig {
        return Ok(collaborators);
    }

    let kubeconfig: Arc<dyn KubeconfigSource> = if args.kubeconfig_from_api {
        Arc::new(EksKubeconfigSource::new())
    } else {
        Arc::new(
            ScriptKubeconfigSource::from_env()
                .context(provisioner::error::CollaboratorSetupSnafu)?,
        )
    };
    Ok(collaborators.with_kubeconfig(kubeconfig))
}

mod error {
    use models::stack::stack_error;
    use models::telemetry::TelemetryConfigError;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to initialize telemetry: {}", source))]
        Telemetry { source: TelemetryConfigError },

        #[snafu(display("{}", source))]
        Provision { source: provisioner::Error },

        #[snafu(display("{}", source))]
        Apply { source: stack_error::Error },

        #[snafu(display("Unable to serialize the plan: {}", source))]
        Serialize { source: serde_yaml::Error },
    }
}
