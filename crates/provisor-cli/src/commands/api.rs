//! Plain API commands: each call prints the response data as JSON.

use serde_json::{Map, Value, json};

use crate::client::ApiClient;

/// Parse `name=value` into a capacity attribute.
pub fn parse_attribute(raw: &str) -> Result<(String, u64), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got {raw:?}"))?;
    if name.is_empty() {
        return Err(format!("empty attribute name in {raw:?}"));
    }
    let value = value
        .parse::<u64>()
        .map_err(|e| format!("attribute {name}: {e}"))?;
    Ok((name.to_string(), value))
}

/// Parse `key=value` into a binding option.
pub fn parse_option(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))
}

/// Build a capacity object from `--memory` and repeated `--attr`.
pub fn capacity(memory: Option<u64>, attrs: &[(String, u64)]) -> Value {
    let mut map = Map::new();
    if let Some(memory) = memory {
        map.insert("memory".into(), json!(memory));
    }
    for (name, value) in attrs {
        map.insert(name.clone(), json!(value));
    }
    Value::Object(map)
}

fn print(data: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(data)?);
    Ok(())
}

pub async fn get(client: &ApiClient, path: &str) -> anyhow::Result<()> {
    print(&client.get(path).await?.into_data()?)
}

pub async fn post(client: &ApiClient, path: &str, body: Option<Value>) -> anyhow::Result<()> {
    print(&client.post(path, body.as_ref()).await?.into_data()?)
}

pub async fn delete(client: &ApiClient, path: &str) -> anyhow::Result<()> {
    print(&client.delete(path).await?.into_data()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_parse() {
        assert_eq!(parse_attribute("disk=20").unwrap(), ("disk".to_string(), 20));
        assert!(parse_attribute("disk").is_err());
        assert!(parse_attribute("=3").is_err());
        assert!(parse_attribute("disk=lots").is_err());
    }

    #[test]
    fn options_keep_everything_after_first_equals() {
        assert_eq!(
            parse_option("dsn=a=b").unwrap(),
            ("dsn".to_string(), "a=b".to_string())
        );
    }

    #[test]
    fn capacity_merges_memory_and_attributes() {
        let value = capacity(Some(256), &[("disk".into(), 10)]);
        assert_eq!(value, json!({ "memory": 256, "disk": 10 }));
        assert_eq!(capacity(None, &[]), json!({}));
    }
}
