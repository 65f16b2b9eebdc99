use crate::collaborators::CollaboratorError;
use crate::network::network_error;
use models::config::config_error;
use models::policy::policy_error;
use models::stack::stack_error;

use snafu::Snafu;

/// The crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// The crate-wide error type.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Unable to declare resources: {}", source))]
    Declare { source: stack_error::Error },

    #[snafu(display("Unable to render policy for '{}': {}", resource, source))]
    Policy {
        resource: String,
        source: policy_error::Error,
    },

    #[snafu(display("Assertion failed: {}", message))]
    Assertion { message: String },

    #[snafu(display(
        "Node group '{}' must satisfy min <= desired <= max: {}",
        node_group,
        source
    ))]
    InvalidScaling {
        node_group: String,
        source: validator::ValidationErrors,
    },

    #[snafu(display("Unable to read the network stack: {}", source))]
    NetworkStack { source: network_error::Error },

    #[snafu(display("Unable to load configuration: {}", source))]
    Config { source: config_error::Error },

    #[snafu(display("Unable to set up collaborator: {}", source))]
    CollaboratorSetup { source: CollaboratorError },

    #[snafu(display("Post-provisioning step '{}' failed: {}", step, source))]
    PostProvision {
        step: String,
        source: CollaboratorError,
    },
}
