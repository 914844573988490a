//! Outbound command channel to backend nodes.
//!
//! The orchestrator never talks to a node directly. It hands a
//! [`NodeCommand`] to a [`NodeChannel`] and interprets the reply:
//!
//! - `Ok(NodeAck::Accepted { .. })`: the node did it
//! - `Ok(NodeAck::Rejected { .. })`: the node explicitly refused (final)
//! - `Err(_)`: transport failure (retryable, like a timeout)
//!
//! Timeouts are applied by the caller, so implementations may simply await
//! the node.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use provisor_state::{CapacityProfile, InstanceId, NodeId};

/// Boxed future alias for node channel replies.
pub type ChannelFuture<'a> = Pin<Box<dyn Future<Output = Result<NodeAck, String>> + Send + 'a>>;

/// Where to send a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEndpoint {
    pub node_id: NodeId,
    /// host:port of the node's command endpoint.
    pub address: String,
}

/// A command for a backend node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum NodeCommand {
    CreateInstance {
        instance_id: InstanceId,
        requester: String,
        profile: CapacityProfile,
    },
    DeleteInstance {
        instance_id: InstanceId,
    },
    Bind {
        instance_id: InstanceId,
        binding_id: String,
        options: Value,
    },
    Unbind {
        instance_id: InstanceId,
        binding_id: String,
    },
    /// Report every instance and binding the node holds, as a
    /// [`NodeInventory`] payload.
    ListInstances,
}

impl NodeCommand {
    pub fn name(&self) -> &'static str {
        match self {
            NodeCommand::CreateInstance { .. } => "create_instance",
            NodeCommand::DeleteInstance { .. } => "delete_instance",
            NodeCommand::Bind { .. } => "bind",
            NodeCommand::Unbind { .. } => "unbind",
            NodeCommand::ListInstances => "list_instances",
        }
    }

    /// The instance the command targets; `None` for node-wide commands.
    pub fn instance_id(&self) -> Option<&str> {
        match self {
            NodeCommand::CreateInstance { instance_id, .. }
            | NodeCommand::DeleteInstance { instance_id }
            | NodeCommand::Bind { instance_id, .. }
            | NodeCommand::Unbind { instance_id, .. } => Some(instance_id),
            NodeCommand::ListInstances => None,
        }
    }
}

/// What a node holds, as reported for [`NodeCommand::ListInstances`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInventory {
    #[serde(default)]
    pub instances: Vec<InstanceId>,
    #[serde(default)]
    pub bindings: Vec<NodeBinding>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeBinding {
    pub instance_id: InstanceId,
    pub binding_id: String,
}

/// A node's answer to a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NodeAck {
    /// Done. `payload` carries e.g. binding credentials.
    Accepted {
        #[serde(default)]
        payload: Value,
    },
    Rejected { reason: String },
}

impl NodeAck {
    pub fn accepted() -> Self {
        NodeAck::Accepted {
            payload: Value::Null,
        }
    }
}

/// Transport to backend nodes.
pub trait NodeChannel: Send + Sync {
    fn send<'a>(&'a self, endpoint: &'a NodeEndpoint, command: &'a NodeCommand) -> ChannelFuture<'a>;
}

// ── In-memory nodes ──────────────────────────────────────────────

/// How a simulated node answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeBehaviour {
    Accept,
    /// Answer after a delay.
    Slow(Duration),
    Reject(String),
    /// Transport error.
    Unreachable,
    /// Never answer.
    Hang,
}

#[derive(Debug, Default)]
struct MemoryNodes {
    instances: BTreeMap<NodeId, BTreeSet<InstanceId>>,
    bindings: BTreeSet<(InstanceId, String)>,
    behaviour: HashMap<NodeId, NodeBehaviour>,
    sent: Vec<(NodeId, NodeCommand)>,
}

/// Simulated nodes living inside the control plane process.
///
/// Accepts every command unless told otherwise with
/// [`set_behaviour`](MemoryChannel::set_behaviour). Used by `provisord
/// --simulate-nodes` and by tests.
#[derive(Debug, Default)]
pub struct MemoryChannel {
    nodes: Mutex<MemoryNodes>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_behaviour(&self, node_id: &str, behaviour: NodeBehaviour) {
        self.lock().behaviour.insert(node_id.to_string(), behaviour);
    }

    /// Instances the simulated node currently holds.
    pub fn instances_on(&self, node_id: &str) -> Vec<InstanceId> {
        self.lock()
            .instances
            .get(node_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn binding_count(&self) -> usize {
        self.lock().bindings.len()
    }

    /// Put an instance on a simulated node behind the control plane's back.
    pub fn plant_instance(&self, node_id: &str, instance_id: &str) {
        self.lock()
            .instances
            .entry(node_id.to_string())
            .or_default()
            .insert(instance_id.to_string());
    }

    /// Put a binding on a simulated node behind the control plane's back.
    pub fn plant_binding(&self, instance_id: &str, binding_id: &str) {
        self.lock()
            .bindings
            .insert((instance_id.to_string(), binding_id.to_string()));
    }

    /// Every command received so far, in order.
    pub fn sent(&self) -> Vec<(NodeId, NodeCommand)> {
        self.lock().sent.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryNodes> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, endpoint: &NodeEndpoint, command: &NodeCommand) -> NodeAck {
        let mut nodes = self.lock();
        let node = endpoint.node_id.clone();
        let payload = match command {
            NodeCommand::CreateInstance { instance_id, .. } => {
                nodes.instances.entry(node).or_default().insert(instance_id.clone());
                Value::Null
            }
            NodeCommand::DeleteInstance { instance_id } => {
                if let Some(set) = nodes.instances.get_mut(&node) {
                    set.remove(instance_id);
                }
                nodes.bindings.retain(|(i, _)| i != instance_id);
                Value::Null
            }
            NodeCommand::Bind {
                instance_id,
                binding_id,
                ..
            } => {
                let hosted = nodes
                    .instances
                    .get(&node)
                    .is_some_and(|set| set.contains(instance_id));
                if !hosted {
                    return NodeAck::Rejected {
                        reason: format!("unknown instance {instance_id}"),
                    };
                }
                nodes.bindings.insert((instance_id.clone(), binding_id.clone()));
                json!({
                    "host": endpoint.address,
                    "name": instance_id,
                    "user": binding_id,
                    "password": format!("{binding_id}-secret"),
                })
            }
            NodeCommand::Unbind {
                instance_id,
                binding_id,
            } => {
                nodes.bindings.remove(&(instance_id.clone(), binding_id.clone()));
                Value::Null
            }
            NodeCommand::ListInstances => {
                let instances: Vec<InstanceId> = nodes
                    .instances
                    .get(&node)
                    .map(|set| set.iter().cloned().collect())
                    .unwrap_or_default();
                let bindings = nodes
                    .bindings
                    .iter()
                    .filter(|(i, _)| instances.contains(i))
                    .map(|(instance_id, binding_id)| NodeBinding {
                        instance_id: instance_id.clone(),
                        binding_id: binding_id.clone(),
                    })
                    .collect();
                serde_json::to_value(NodeInventory { instances, bindings }).unwrap_or_default()
            }
        };
        NodeAck::Accepted { payload }
    }
}

impl NodeChannel for MemoryChannel {
    fn send<'a>(&'a self, endpoint: &'a NodeEndpoint, command: &'a NodeCommand) -> ChannelFuture<'a> {
        Box::pin(async move {
            let behaviour = {
                let mut nodes = self.lock();
                nodes.sent.push((endpoint.node_id.clone(), command.clone()));
                nodes
                    .behaviour
                    .get(&endpoint.node_id)
                    .cloned()
                    .unwrap_or(NodeBehaviour::Accept)
            };
            debug!(node_id = %endpoint.node_id, command = command.name(), ?behaviour, "simulated node command");

            match behaviour {
                NodeBehaviour::Accept => Ok(self.apply(endpoint, command)),
                NodeBehaviour::Slow(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(self.apply(endpoint, command))
                }
                NodeBehaviour::Reject(reason) => Ok(NodeAck::Rejected { reason }),
                NodeBehaviour::Unreachable => Err(format!("{}: connection refused", endpoint.address)),
                NodeBehaviour::Hang => std::future::pending::<Result<NodeAck, String>>().await,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use provisor_state::{Attributes, MEMORY};

    fn endpoint(id: &str) -> NodeEndpoint {
        NodeEndpoint {
            node_id: id.to_string(),
            address: format!("{id}:9400"),
        }
    }

    fn create(id: &str) -> NodeCommand {
        NodeCommand::CreateInstance {
            instance_id: id.to_string(),
            requester: "tenant-a".to_string(),
            profile: Attributes::from([(MEMORY, 64)]),
        }
    }

    #[test]
    fn command_wire_format() {
        let json = serde_json::to_value(create("i1")).unwrap();
        assert_eq!(json["command"], "create_instance");
        assert_eq!(json["profile"]["memory"], 64);

        let ack: NodeAck = serde_json::from_str(r#"{"status":"accepted"}"#).unwrap();
        assert_eq!(ack, NodeAck::accepted());
        let ack: NodeAck = serde_json::from_str(r#"{"status":"rejected","reason":"full"}"#).unwrap();
        assert_eq!(ack, NodeAck::Rejected { reason: "full".into() });
    }

    #[tokio::test]
    async fn memory_channel_tracks_instances_and_bindings() {
        let channel = MemoryChannel::new();
        let node = endpoint("node-x");

        channel.send(&node, &create("i1")).await.unwrap();
        assert_eq!(channel.instances_on("node-x"), vec!["i1".to_string()]);

        let bind = NodeCommand::Bind {
            instance_id: "i1".into(),
            binding_id: "b1".into(),
            options: Value::Null,
        };
        let ack = channel.send(&node, &bind).await.unwrap();
        let NodeAck::Accepted { payload } = ack else {
            panic!("bind rejected");
        };
        assert_eq!(payload["user"], "b1");
        assert_eq!(channel.binding_count(), 1);

        let delete = NodeCommand::DeleteInstance { instance_id: "i1".into() };
        channel.send(&node, &delete).await.unwrap();
        assert!(channel.instances_on("node-x").is_empty());
        assert_eq!(channel.binding_count(), 0);
        assert_eq!(channel.sent().len(), 3);
    }

    #[tokio::test]
    async fn memory_channel_behaviours() {
        let channel = MemoryChannel::new();
        channel.set_behaviour("node-r", NodeBehaviour::Reject("disk full".into()));
        channel.set_behaviour("node-u", NodeBehaviour::Unreachable);

        let ack = channel.send(&endpoint("node-r"), &create("i1")).await.unwrap();
        assert_eq!(ack, NodeAck::Rejected { reason: "disk full".into() });
        assert!(channel.send(&endpoint("node-u"), &create("i1")).await.is_err());
        assert!(channel.instances_on("node-r").is_empty());
    }

    #[tokio::test]
    async fn memory_channel_lists_what_a_node_holds() {
        let channel = MemoryChannel::new();
        channel.send(&endpoint("node-x"), &create("i1")).await.unwrap();
        channel.send(&endpoint("node-y"), &create("i2")).await.unwrap();
        channel.plant_instance("node-x", "stray");
        channel.plant_binding("i1", "b1");
        channel.plant_binding("i2", "b2");

        let ack = channel
            .send(&endpoint("node-x"), &NodeCommand::ListInstances)
            .await
            .unwrap();
        let NodeAck::Accepted { payload } = ack else {
            panic!("list rejected");
        };
        let inventory: NodeInventory = serde_json::from_value(payload).unwrap();

        assert_eq!(inventory.instances, vec!["i1".to_string(), "stray".to_string()]);
        assert_eq!(
            inventory.bindings,
            vec![NodeBinding {
                instance_id: "i1".into(),
                binding_id: "b1".into(),
            }]
        );
        assert_eq!(NodeCommand::ListInstances.instance_id(), None);
        assert_eq!(
            serde_json::to_value(NodeCommand::ListInstances).unwrap(),
            json!({"command": "list_instances"})
        );
    }

    #[tokio::test]
    async fn bind_on_unknown_instance_is_rejected() {
        let channel = MemoryChannel::new();
        let bind = NodeCommand::Bind {
            instance_id: "ghost".into(),
            binding_id: "b1".into(),
            options: Value::Null,
        };
        let ack = channel.send(&endpoint("node-x"), &bind).await.unwrap();
        assert!(matches!(ack, NodeAck::Rejected { .. }));
    }
}
