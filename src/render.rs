use crate::config::Settings;
use crate::stack::StackPlan;
use serde::Serialize;

pub fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(e) => eprintln!("failed to serialize json: {}", e),
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct ErrorOut<'a> {
    pub code: &'a str,
    pub message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<&'a str>,
}

pub fn print_json_error(code: &str, message: &str, hint: Option<&str>) {
    let err = ErrorOut { code, message, hint };
    print_json(&err);
}

/// Renders a settings value on one line: scalars bare, everything else as
/// flow-style JSON.
pub fn value_text(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Null => "null".to_string(),
        other => serde_json::to_string(other).unwrap_or_else(|_| format!("{:?}", other)),
    }
}

pub fn render_settings_text(settings: &Settings) {
    println!("environment: {}", settings.environment());
    if settings.is_empty() {
        println!("(no settings)");
        return;
    }
    for (key, value) in settings.iter() {
        println!("{} = {}", key, value_text(value));
    }
}

pub fn render_plan_text(plan: &StackPlan) {
    println!("Stack: {} (account {}, region {})", plan.stack_name, plan.account_id, plan.region);
    println!("\nVPC endpoint:");
    println!("- {} {}:{}", plan.vpc_endpoint.logical_id, plan.vpc_endpoint.vpc_endpoint_id, plan.vpc_endpoint.port);
    println!("\nREST API:");
    println!("- {} {} (stage {})", plan.rest_api.logical_id, plan.rest_api.name, plan.rest_api.stage_name);
    println!("\nFunction:");
    let f = &plan.function;
    println!(
        "- {} {} {} {}MB {}s vpc {} subnets [{}]",
        f.logical_id, f.handler, f.runtime, f.memory_size_mb, f.timeout_secs, f.vpc_id, f.subnet_ids.join(", ")
    );
    println!("\nRoutes:");
    for route in &plan.routes { println!("- {} /{}", route.method, route.path); }
    println!("\nOutputs:");
    for output in &plan.outputs { println!("{}.{} = {}", plan.stack_name, output.key, output.value); }
}
