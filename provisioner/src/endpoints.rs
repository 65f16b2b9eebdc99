//! VPC endpoints for the AWS services nodes reach without leaving the VPC.
use crate::error::{self, Result};
use models::component_token;
use models::graph::ResourceKind;
use models::output::Output;
use models::stack::{Resource, ResourceArgs, ResourceOptions, Stack};

use snafu::ResultExt;
use tracing::{event, Level};

#[derive(Clone, Debug)]
pub struct EndpointArgs {
    pub region: String,
    pub vpc_id: Output<String>,
    /// Where interface endpoints place their network interfaces.
    pub subnet_ids: Output<Vec<String>>,
    pub security_group_ids: Output<Vec<String>>,
    /// Where gateway endpoints add their routes.
    pub route_table_ids: Output<Vec<String>>,
    pub interface_services: Vec<String>,
    pub gateway_services: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct VpcEndpoints {
    pub component: Resource,
    pub interface_endpoints: Vec<Resource>,
    pub gateway_endpoints: Vec<Resource>,
}

#[derive(Clone, Copy, Debug)]
enum EndpointType {
    Interface,
    Gateway,
}

impl EndpointType {
    fn as_str(self) -> &'static str {
        match self {
            EndpointType::Interface => "Interface",
            EndpointType::Gateway => "Gateway",
        }
    }
}

/// `com.amazonaws.<region>.<service>`
pub fn service_name(region: &str, service: &str) -> String {
    format!("com.amazonaws.{}.{}", region, service)
}

/// Declares one interface endpoint per interface service and one gateway endpoint per gateway
/// service.
pub fn create_endpoints(
    stack: &Stack,
    name: &str,
    args: &EndpointArgs,
    options: ResourceOptions,
) -> Result<VpcEndpoints> {
    let component = stack
        .register_component(component_token!("network", "VpcEndpoints"), name, options)
        .context(error::DeclareSnafu)?;

    let interface_endpoints = args
        .interface_services
        .iter()
        .map(|service| {
            declare_endpoint(
                stack,
                &component,
                EndpointType::Interface,
                &args.region,
                service,
                ResourceArgs::new()
                    .set_output("vpcId", &args.vpc_id)
                    .set("autoAccept", true)
                    .set_output("subnetIds", &args.subnet_ids)
                    .set("privateDnsEnabled", true)
                    .set_output("securityGroupIds", &args.security_group_ids),
            )
        })
        .collect::<Result<Vec<_>>>()?;

    let gateway_endpoints = args
        .gateway_services
        .iter()
        .map(|service| {
            declare_endpoint(
                stack,
                &component,
                EndpointType::Gateway,
                &args.region,
                service,
                ResourceArgs::new()
                    .set_output("vpcId", &args.vpc_id)
                    .set("autoAccept", true)
                    .set_output("routeTableIds", &args.route_table_ids),
            )
        })
        .collect::<Result<Vec<_>>>()?;

    event!(
        Level::DEBUG,
        interface = interface_endpoints.len(),
        gateway = gateway_endpoints.len(),
        "Declared VPC endpoints."
    );
    Ok(VpcEndpoints {
        component,
        interface_endpoints,
        gateway_endpoints,
    })
}

/// Logical names carry the endpoint type, so a service such as S3 can have both kinds.
fn declare_endpoint(
    stack: &Stack,
    component: &Resource,
    endpoint_type: EndpointType,
    region: &str,
    service: &str,
    args: ResourceArgs,
) -> Result<Resource> {
    stack
        .register(
            ResourceKind::Ec2VpcEndpoint,
            format!(
                "vpc-endpoint-{}-{}",
                endpoint_type.as_str().to_lowercase(),
                service
            ),
            args.set("vpcEndpointType", endpoint_type.as_str())
                .set("serviceName", service_name(region, service)),
            ResourceOptions::new().parent(component),
        )
        .context(error::DeclareSnafu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::engine::PreviewEngine;
    use serde_json::json;
    use std::sync::Arc;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_interface_and_gateway_endpoints() {
        let stack = Stack::new(Arc::new(PreviewEngine::new("123456789012", "eu-west-1")));
        let endpoints = create_endpoints(
            &stack,
            "vpc-endpoints",
            &EndpointArgs {
                region: "eu-west-1".to_string(),
                vpc_id: Output::known("vpc-1".to_string()),
                subnet_ids: Output::known(strings(&["subnet-a", "subnet-b"])),
                security_group_ids: Output::known(strings(&["sg-1"])),
                route_table_ids: Output::known(strings(&["rtb-1"])),
                interface_services: strings(&["ecr.api", "sts"]),
                gateway_services: strings(&["s3"]),
            },
            ResourceOptions::new(),
        )
        .unwrap();
        assert_eq!(endpoints.interface_endpoints.len(), 2);
        assert_eq!(endpoints.gateway_endpoints.len(), 1);
        stack.apply().await.unwrap();

        for endpoint in &endpoints.interface_endpoints {
            let declaration = stack.declaration(endpoint.id()).unwrap().unwrap();
            assert_eq!(declaration.str_property("vpcEndpointType"), Some("Interface"));
            assert_eq!(declaration.property("privateDnsEnabled"), Some(&json!(true)));
            assert_eq!(declaration.property("securityGroupIds"), Some(&json!(["sg-1"])));
            assert!(declaration.property("routeTableIds").is_none());
        }

        let gateway = stack
            .declaration(endpoints.gateway_endpoints[0].id())
            .unwrap()
            .unwrap();
        assert_eq!(
            gateway.str_property("serviceName"),
            Some("com.amazonaws.eu-west-1.s3")
        );
        assert_eq!(gateway.property("routeTableIds"), Some(&json!(["rtb-1"])));
        assert!(gateway.property("securityGroupIds").is_none());
        assert!(gateway.property("subnetIds").is_none());
    }

    #[tokio::test]
    async fn test_service_with_both_endpoint_types() {
        let stack = Stack::new(Arc::new(PreviewEngine::new("123456789012", "us-west-2")));
        let endpoints = create_endpoints(
            &stack,
            "vpc-endpoints",
            &EndpointArgs {
                region: "us-west-2".to_string(),
                vpc_id: Output::known("vpc-1".to_string()),
                subnet_ids: Output::known(strings(&["subnet-a"])),
                security_group_ids: Output::known(strings(&["sg-1"])),
                route_table_ids: Output::known(strings(&["rtb-1"])),
                interface_services: strings(&["s3"]),
                gateway_services: strings(&["s3"]),
            },
            ResourceOptions::new(),
        )
        .unwrap();
        assert_eq!(endpoints.interface_endpoints[0].id().name, "vpc-endpoint-interface-s3");
        assert_eq!(endpoints.gateway_endpoints[0].id().name, "vpc-endpoint-gateway-s3");

        stack.apply().await.unwrap();
        let declarations = stack
            .declarations_of(&ResourceKind::Ec2VpcEndpoint)
            .unwrap();
        assert_eq!(declarations.len(), 2);
        for declaration in &declarations {
            assert_eq!(
                declaration.str_property("serviceName"),
                Some("com.amazonaws.us-west-2.s3")
            );
        }
    }
}
