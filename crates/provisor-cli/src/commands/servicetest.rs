//! `create-test` / `verify-test`: provision one instance of every test
//! service for an application, bind it, and check the result.
//!
//! Instances are named `{service}_{appname}`; each binding carries the
//! application name in its options.

use serde_json::{Value, json};

use crate::client::ApiClient;

pub const SERVICES: [&str; 4] = ["mongodb", "mysql", "redis", "rabbitmq"];

/// Memory asked for each test instance.
const TEST_MEMORY: u64 = 64;

#[derive(Debug)]
pub struct ServiceCheck {
    pub service: &'static str,
    pub instance_id: String,
    pub outcome: Result<String, String>,
}

impl ServiceCheck {
    pub fn passed(&self) -> bool {
        self.outcome.is_ok()
    }
}

pub fn instance_id(service: &str, app: &str) -> String {
    format!("{service}_{app}")
}

pub async fn create(client: &ApiClient, app: &str) -> anyhow::Result<Vec<ServiceCheck>> {
    let mut checks = Vec::with_capacity(SERVICES.len());
    for service in SERVICES {
        let id = instance_id(service, app);
        let outcome = create_one(client, app, &id).await?;
        checks.push(ServiceCheck {
            service,
            instance_id: id,
            outcome,
        });
    }
    Ok(checks)
}

async fn create_one(client: &ApiClient, app: &str, id: &str) -> anyhow::Result<Result<String, String>> {
    let request = json!({
        "instance_id": id,
        "requester": app,
        "profile": { "memory": TEST_MEMORY },
    });
    let instance = match client.post("/instances", Some(&request)).await?.into_data() {
        Ok(data) => data["instance"].clone(),
        Err(e) => return Ok(Err(format!("provision failed: {e}"))),
    };
    let node = instance["node_id"].as_str().unwrap_or("?").to_string();

    if let Some(existing) = app_binding(client, app, id).await? {
        return Ok(Ok(format!("on {node}, binding {} (existing)", existing["id"].as_str().unwrap_or("?"))));
    }

    let bind = json!({ "options": { "app": app } });
    match client
        .post(&format!("/instances/{id}/bindings"), Some(&bind))
        .await?
        .into_data()
    {
        Ok(binding) => Ok(Ok(format!("on {node}, binding {}", binding["id"].as_str().unwrap_or("?")))),
        Err(e) => Ok(Err(format!("bind failed: {e}"))),
    }
}

pub async fn verify(client: &ApiClient, app: &str) -> anyhow::Result<Vec<ServiceCheck>> {
    let mut checks = Vec::with_capacity(SERVICES.len());
    for service in SERVICES {
        let id = instance_id(service, app);
        let outcome = verify_one(client, app, &id).await?;
        checks.push(ServiceCheck {
            service,
            instance_id: id,
            outcome,
        });
    }
    Ok(checks)
}

async fn verify_one(client: &ApiClient, app: &str, id: &str) -> anyhow::Result<Result<String, String>> {
    let instance = match client.get(&format!("/instances/{id}")).await?.into_data() {
        Ok(data) => data,
        Err(e) => return Ok(Err(format!("instance missing: {e}"))),
    };
    let state = instance["state"].as_str().unwrap_or("unknown");
    if state != "provisioned" {
        return Ok(Err(format!("instance is {state}")));
    }
    let node = instance["node_id"].as_str().unwrap_or("?");

    match app_binding(client, app, id).await? {
        Some(binding) if !binding["credentials"].is_null() => Ok(Ok(format!("provisioned on {node}, bound"))),
        Some(_) => Ok(Err("binding has no credentials".to_string())),
        None => Ok(Err(format!("no binding for {app}"))),
    }
}

/// The binding of instance `id` created for `app`, if any.
async fn app_binding(client: &ApiClient, app: &str, id: &str) -> anyhow::Result<Option<Value>> {
    let bindings = match client.get(&format!("/instances/{id}/bindings")).await?.into_data() {
        Ok(Value::Array(bindings)) => bindings,
        _ => return Ok(None),
    };
    Ok(bindings.into_iter().find(|b| b["options"]["app"] == app))
}

/// Print one line per service. Returns the number of failed checks.
pub fn print_report(checks: &[ServiceCheck]) -> usize {
    let mut failed = 0;
    for check in checks {
        match &check.outcome {
            Ok(detail) => println!("Service: {:<10} ✓ {} {detail}", check.service, check.instance_id),
            Err(reason) => {
                failed += 1;
                println!("Service: {:<10} ✗ {} {reason}", check.service, check.instance_id);
            }
        }
    }
    failed
}
