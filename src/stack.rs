//! Declarative description of the private gateway deployment.
//!
//! Nothing here talks to a cloud API. [`synth`] turns merged [`Settings`] into
//! a [`StackPlan`], the same shape an infrastructure-as-code framework would be
//! handed: an imported VPC endpoint, a private REST API locked to that
//! endpoint, the token-count function placed in the VPC, one proxy route and
//! the endpoint URL output.

use crate::config::{ConfigError, Settings};
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use serde_yaml::Value;
use std::{fs, path::{Path, PathBuf}};
use tracing::info;

pub const STACK_PREFIX: &str = "ContentApiGateway";
pub const VPC_ENDPOINT_PORT: u16 = 443;
pub const FUNCTION_CODE_ASSET: &str = "lambda/count-token";
pub const FUNCTION_HANDLER: &str = "lambda_function.lambda_handler";
pub const FUNCTION_RUNTIME: &str = "python3.10";
pub const FUNCTION_ARCHITECTURE: &str = "x86_64";
pub const BUNDLING_IMAGE: &str = "public.ecr.aws/sam/build-python3.10";
pub const BUNDLING_COMMAND: [&str; 3] =
    ["bash", "-c", "pip install -r requirements.txt -t /asset-output && cp -au . /asset-output"];
pub const FUNCTION_MEMORY_MB: u32 = 256;
pub const FUNCTION_TIMEOUT_SECS: u32 = 15;
pub const COUNT_TOKEN_PATH: &str = "count-token";
pub const ENDPOINT_OUTPUT_KEY: &str = "ActualPrivateApiGatewayEndpoint";
pub const REST_API_ID_PLACEHOLDER: &str = "{rest_api_id}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EndpointType {
    Private,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Integration {
    LambdaProxy { function: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct VpcEndpointImport {
    pub logical_id: String,
    pub vpc_endpoint_id: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestApiSpec {
    pub logical_id: String,
    pub name: String,
    pub description: String,
    pub endpoint_types: Vec<EndpointType>,
    pub vpc_endpoint_ids: Vec<String>,
    pub cloud_watch_role: bool,
    pub stage_name: String,
    pub policy: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct BundlingSpec {
    pub image: String,
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionSpec {
    pub logical_id: String,
    pub code_asset: String,
    pub bundling: BundlingSpec,
    pub handler: String,
    pub runtime: String,
    pub architecture: String,
    pub memory_size_mb: u32,
    pub timeout_secs: u32,
    pub vpc_id: String,
    pub subnet_ids: Vec<String>,
}

impl FunctionSpec {
    /// Source file the handler string points at, relative to the code asset.
    pub fn handler_file(&self) -> String {
        let module = self.handler.rsplit_once('.').map_or(self.handler.as_str(), |(m, _)| m);
        format!("{}.py", module.replace('.', "/"))
    }

    /// Files the bundling step needs that are absent under `root`.
    pub fn missing_asset_files(&self, root: &Path) -> Vec<PathBuf> {
        let asset = root.join(&self.code_asset);
        [self.handler_file(), "requirements.txt".to_string()]
            .into_iter()
            .map(|f| asset.join(f))
            .filter(|p| !p.is_file())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteSpec {
    pub logical_id: String,
    pub path: String,
    pub method: String,
    pub integration: Integration,
}

#[derive(Debug, Clone, Serialize)]
pub struct StackOutput {
    pub key: String,
    pub value: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StackPlan {
    pub stack_name: String,
    pub environment: String,
    pub account_id: String,
    pub region: String,
    pub vpc_endpoint: VpcEndpointImport,
    pub rest_api: RestApiSpec,
    pub function: FunctionSpec,
    pub routes: Vec<RouteSpec>,
    pub outputs: Vec<StackOutput>,
}

impl StackPlan {
    pub fn output(&self, key: &str) -> Option<&StackOutput> {
        self.outputs.iter().find(|o| o.key == key)
    }
}

/// Settings keys the plan is built from.
#[derive(Debug, Clone)]
pub struct StackInputs {
    pub account_id: String,
    pub region: String,
    pub vpc_id: String,
    pub vpc_endpoint_id: String,
    pub subnet_ids: Vec<String>,
}

impl StackInputs {
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self {
            account_id: scalar_string(settings, "account_id")?,
            region: scalar_string(settings, "region")?,
            vpc_id: scalar_string(settings, "vpc_id")?,
            vpc_endpoint_id: scalar_string(settings, "vpc_endpoint_id")?,
            subnet_ids: settings.get_as("subnet_ids")?,
        })
    }
}

// Account ids are often written unquoted and parse as numbers.
fn scalar_string(settings: &Settings, key: &str) -> Result<String, ConfigError> {
    match settings.get(key)? {
        Value::Number(n) => Ok(n.to_string()),
        _ => settings.get_as(key),
    }
}

/// CDK-style logical id: the alphanumeric part of the construct id plus eight
/// hex digits of the md5 of the full construct path.
pub fn logical_id(stack_name: &str, construct_id: &str) -> String {
    let path = format!("{}/{}", stack_name, construct_id);
    let digest = format!("{:x}", md5::compute(path.as_bytes())).to_uppercase();
    let human: String = construct_id.chars().filter(char::is_ascii_alphanumeric).collect();
    format!("{}{}", human, &digest[..8])
}

pub fn endpoint_url(rest_api_id: Option<&str>, vpc_endpoint_id: &str, region: &str, stage: &str) -> String {
    format!(
        "https://{}-{}.execute-api.{}.amazonaws.com/{}",
        rest_api_id.unwrap_or(REST_API_ID_PLACEHOLDER),
        vpc_endpoint_id,
        region,
        stage
    )
}

fn source_vpce_policy(vpc_endpoint_id: &str) -> serde_json::Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "AWS": "*" },
            "Action": "execute-api:Invoke",
            "Resource": "execute-api:/*",
            "Condition": { "StringEquals": { "aws:SourceVpce": vpc_endpoint_id } }
        }]
    })
}

pub fn synth(settings: &Settings, rest_api_id: Option<&str>) -> Result<StackPlan, ConfigError> {
    let inputs = StackInputs::from_settings(settings)?;
    let environment = settings.environment().to_string();
    let stack_name = format!("{}-{}", STACK_PREFIX, environment);

    let vpc_endpoint = VpcEndpointImport {
        logical_id: logical_id(&stack_name, "ApiGatewayVPCE"),
        vpc_endpoint_id: inputs.vpc_endpoint_id.clone(),
        port: VPC_ENDPOINT_PORT,
    };

    let rest_api = RestApiSpec {
        logical_id: logical_id(&stack_name, "PrivateApi"),
        name: format!("bic-{}-content-private-apigateway", environment),
        description: "Private API Gateway for the Content service".to_string(),
        endpoint_types: vec![EndpointType::Private],
        vpc_endpoint_ids: vec![inputs.vpc_endpoint_id.clone()],
        cloud_watch_role: true,
        stage_name: environment.clone(),
        policy: source_vpce_policy(&inputs.vpc_endpoint_id),
    };

    let function = FunctionSpec {
        logical_id: logical_id(&stack_name, "CountTokenFunction"),
        code_asset: FUNCTION_CODE_ASSET.to_string(),
        bundling: BundlingSpec {
            image: BUNDLING_IMAGE.to_string(),
            command: BUNDLING_COMMAND.iter().map(|s| s.to_string()).collect(),
        },
        handler: FUNCTION_HANDLER.to_string(),
        runtime: FUNCTION_RUNTIME.to_string(),
        architecture: FUNCTION_ARCHITECTURE.to_string(),
        memory_size_mb: FUNCTION_MEMORY_MB,
        timeout_secs: FUNCTION_TIMEOUT_SECS,
        vpc_id: inputs.vpc_id.clone(),
        subnet_ids: inputs.subnet_ids.clone(),
    };

    let routes = vec![RouteSpec {
        logical_id: logical_id(&stack_name, "PrivateApi/count-token/POST"),
        path: COUNT_TOKEN_PATH.to_string(),
        method: "POST".to_string(),
        integration: Integration::LambdaProxy { function: function.logical_id.clone() },
    }];

    let outputs = vec![StackOutput {
        key: ENDPOINT_OUTPUT_KEY.to_string(),
        value: endpoint_url(rest_api_id, &inputs.vpc_endpoint_id, &inputs.region, &rest_api.stage_name),
        description: "The Route53 alias which can be used to call the api internally.".to_string(),
    }];

    info!(stack = %stack_name, region = %inputs.region, "synthesized stack plan");

    Ok(StackPlan {
        stack_name,
        environment,
        account_id: inputs.account_id,
        region: inputs.region,
        vpc_endpoint,
        rest_api,
        function,
        routes,
        outputs,
    })
}

pub fn write_plan(plan: &StackPlan, out_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(out_dir).with_context(|| format!("creating output dir: {}", out_dir.display()))?;
    let path = out_dir.join(format!("{}.plan.json", plan.stack_name));
    let text = serde_json::to_string_pretty(plan).context("serializing stack plan")?;
    fs::write(&path, text).with_context(|| format!("writing stack plan: {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEV_YAML: &str = "account_id: 123456789012\nregion: ap-southeast-1\nvpc_id: vpc-0abc\nvpc_endpoint_id: vpce-0123\nsubnet_ids:\n  - subnet-a\n  - subnet-b\n";

    fn settings(env_yaml: &str) -> (tempfile::TempDir, Settings) {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("dev.yaml"), env_yaml).unwrap();
        let settings = Settings::load(temp.path(), Some("dev")).unwrap();
        (temp, settings)
    }

    #[test]
    fn plan_carries_network_placement() {
        let (_temp, settings) = settings(DEV_YAML);
        let plan = synth(&settings, None).unwrap();

        assert_eq!(plan.stack_name, "ContentApiGateway-dev");
        assert_eq!(plan.account_id, "123456789012");
        assert_eq!(plan.rest_api.name, "bic-dev-content-private-apigateway");
        assert_eq!(plan.rest_api.stage_name, "dev");
        assert_eq!(plan.rest_api.endpoint_types, vec![EndpointType::Private]);
        assert_eq!(plan.vpc_endpoint.port, 443);
        assert_eq!(plan.function.vpc_id, "vpc-0abc");
        assert_eq!(plan.function.subnet_ids, vec!["subnet-a", "subnet-b"]);
        assert_eq!(plan.function.memory_size_mb, 256);
        assert_eq!(plan.function.timeout_secs, 15);
        assert_eq!(plan.routes[0].method, "POST");
        assert_eq!(
            plan.routes[0].integration,
            Integration::LambdaProxy { function: plan.function.logical_id.clone() }
        );
    }

    #[test]
    fn policy_is_scoped_to_the_vpc_endpoint() {
        let (_temp, settings) = settings(DEV_YAML);
        let plan = synth(&settings, None).unwrap();
        let statement = &plan.rest_api.policy["Statement"][0];
        assert_eq!(statement["Action"], "execute-api:Invoke");
        assert_eq!(statement["Condition"]["StringEquals"]["aws:SourceVpce"], "vpce-0123");
    }

    #[test]
    fn endpoint_output_uses_placeholder_until_api_id_known() {
        let (_temp, settings) = settings(DEV_YAML);
        let plan = synth(&settings, None).unwrap();
        assert_eq!(
            plan.output(ENDPOINT_OUTPUT_KEY).unwrap().value,
            "https://{rest_api_id}-vpce-0123.execute-api.ap-southeast-1.amazonaws.com/dev"
        );
        let plan = synth(&settings, Some("a1b2c3")).unwrap();
        assert_eq!(
            plan.output(ENDPOINT_OUTPUT_KEY).unwrap().value,
            "https://a1b2c3-vpce-0123.execute-api.ap-southeast-1.amazonaws.com/dev"
        );
    }

    #[test]
    fn logical_ids_are_stable_and_distinct() {
        let a = logical_id("ContentApiGateway-dev", "PrivateApi");
        assert_eq!(a, logical_id("ContentApiGateway-dev", "PrivateApi"));
        assert_ne!(a, logical_id("ContentApiGateway-prod", "PrivateApi"));
        assert!(a.starts_with("PrivateApi"));
        assert_eq!(a.len(), "PrivateApi".len() + 8);
    }

    #[test]
    fn missing_setting_fails_synth() {
        let (_temp, settings) = settings("region: us-east-1\n");
        let err = synth(&settings, None).unwrap_err();
        assert!(matches!(err, ConfigError::KeyNotFound { .. }));
    }

    #[test]
    fn writes_plan_json() {
        let (temp, settings) = settings(DEV_YAML);
        let plan = synth(&settings, None).unwrap();
        let path = write_plan(&plan, &temp.path().join("out")).unwrap();
        assert!(path.ends_with("ContentApiGateway-dev.plan.json"));
        let v: serde_json::Value = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(v["function"]["handler"], FUNCTION_HANDLER);
    }

    #[test]
    fn function_asset_exists_in_repo() {
        let (_temp, settings) = settings(DEV_YAML);
        let plan = synth(&settings, None).unwrap();
        let root = Path::new(env!("CARGO_MANIFEST_DIR"));

        assert_eq!(plan.function.handler_file(), "lambda_function.py");
        assert!(root.join(&plan.function.code_asset).is_dir());
        assert!(plan.function.missing_asset_files(root).is_empty());
        assert!(plan.function.bundling.command[2].contains("pip install -r requirements.txt"));
    }

    #[test]
    fn reports_missing_asset_files() {
        let (temp, settings) = settings(DEV_YAML);
        let plan = synth(&settings, None).unwrap();
        let missing = plan.function.missing_asset_files(temp.path());
        assert_eq!(missing.len(), 2);
        assert!(missing[0].ends_with("lambda/count-token/lambda_function.py"));
    }
}
