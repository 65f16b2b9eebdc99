//! Assume-role policies.
use super::{OneOrMany, PolicyDocument, Statement};
use crate::constants::STS_AUDIENCE;

use serde::{Deserialize, Serialize};

const ASSUME_ROLE: &str = "sts:AssumeRole";
const ASSUME_ROLE_WITH_WEB_IDENTITY: &str = "sts:AssumeRoleWithWebIdentity";

/// Trust for AWS services such as `eks.amazonaws.com` or `ec2.amazonaws.com`.
pub fn service_trust_policy(services: &[&str]) -> PolicyDocument {
    let principal = match services {
        [service] => OneOrMany::from(*service),
        services => OneOrMany::from(services),
    };
    PolicyDocument::new(vec![
        Statement::allow(ASSUME_ROLE).service_principal(principal)
    ])
}

/// The single service account an IRSA role may be assumed from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrsaTrust {
    pub account_id: String,
    /// The cluster's OIDC issuer, without `https://`.
    pub issuer: String,
    pub namespace: String,
    pub service_account: String,
}

impl IrsaTrust {
    pub fn provider_arn(&self) -> String {
        format!(
            "arn:aws:iam::{}:oidc-provider/{}",
            self.account_id, self.issuer
        )
    }

    pub fn subject(&self) -> String {
        format!(
            "system:serviceaccount:{}:{}",
            self.namespace, self.service_account
        )
    }

    pub fn audience_key(&self) -> String {
        format!("{}:aud", self.issuer)
    }

    pub fn subject_key(&self) -> String {
        format!("{}:sub", self.issuer)
    }

    pub fn document(&self) -> PolicyDocument {
        PolicyDocument::new(vec![Statement::allow(ASSUME_ROLE_WITH_WEB_IDENTITY)
            .federated_principal(self.provider_arn())
            .condition("StringEquals", self.audience_key(), STS_AUDIENCE)
            .condition("StringEquals", self.subject_key(), self.subject())])
    }
}
