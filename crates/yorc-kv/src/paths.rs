//! Bit-exact KV path conventions (§6) and the attribute-path parser.
//!
//! Every entity the core addresses lives under a literal, `/`-separated
//! path. Building and parsing these paths is kept in one place so the two
//! stay inverse of each other: [`AttributeData::path`] and
//! [`parse_attribute_path`] must round-trip.

use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("malformed attribute path: {0}")]
pub struct MalformedPath(pub String);

pub fn deployment_topology_prefix(deployment_id: &str) -> String {
    format!("_yorc/deployments/{deployment_id}/topology")
}

pub fn node_instance_attribute(deployment_id: &str, node: &str, instance: &str, attr: &str) -> String {
    format!(
        "{}/instances/{node}/{instance}/attributes/{attr}",
        deployment_topology_prefix(deployment_id)
    )
}

pub fn capability_attribute(
    deployment_id: &str,
    node: &str,
    instance: &str,
    capability: &str,
    attr: &str,
) -> String {
    format!(
        "{}/instances/{node}/{instance}/capabilities/{capability}/attributes/{attr}",
        deployment_topology_prefix(deployment_id)
    )
}

pub fn relationship_instance_attribute(
    deployment_id: &str,
    node: &str,
    requirement_index: &str,
    instance: &str,
    attr: &str,
) -> String {
    format!(
        "{}/relationship_instances/{node}/{requirement_index}/{instance}/attributes/{attr}",
        deployment_topology_prefix(deployment_id)
    )
}

pub fn operation_output(
    deployment_id: &str,
    node: &str,
    instance: &str,
    interface: &str,
    operation: &str,
    output: &str,
) -> String {
    format!(
        "{}/instances/{node}/{instance}/outputs/{interface}/{operation}/{output}",
        deployment_topology_prefix(deployment_id)
    )
}

pub fn notification_edge(source_key: &str, attr: &str, index: u64) -> String {
    format!("{source_key}/attribute_notifications/{attr}/{index}")
}

pub fn notification_edge_prefix(source_key: &str, attr: &str) -> String {
    format!("{source_key}/attribute_notifications/{attr}/")
}

/// Prefix identifying a notifier's home: the instance itself, with no
/// `attributes/...` suffix. The source key a plain-attribute notifier's
/// edges are recorded under.
pub fn node_instance_prefix(deployment_id: &str, node: &str, instance: &str) -> String {
    format!(
        "{}/instances/{node}/{instance}",
        deployment_topology_prefix(deployment_id)
    )
}

/// Source key for a capability-attribute notifier.
pub fn capability_prefix(deployment_id: &str, node: &str, instance: &str, capability: &str) -> String {
    format!("{}/capabilities/{capability}", node_instance_prefix(deployment_id, node, instance))
}

/// Source key for an operation-output notifier.
pub fn operation_prefix(
    deployment_id: &str,
    node: &str,
    instance: &str,
    interface: &str,
    operation: &str,
) -> String {
    format!(
        "{}/outputs/{interface}/{operation}",
        node_instance_prefix(deployment_id, node, instance)
    )
}

/// Marker key recording that `(node, instance)` is a substitution instance
/// (the external view of a composite sub-deployment).
pub fn substitution_instance_marker(deployment_id: &str, node: &str, instance: &str) -> String {
    format!(
        "{}/substitution_instances/{node}/{instance}",
        deployment_topology_prefix(deployment_id)
    )
}

pub fn workflow_step_status(task_id: &str, step_name: &str) -> String {
    format!("_yorc/workflows/{task_id}/{step_name}")
}

/// Prefix under which a workflow's step definitions live, keyed by
/// deployment and workflow name (one workflow definition per deployment).
pub fn workflow_steps_prefix(deployment_id: &str, workflow_name: &str) -> String {
    format!(
        "{}/workflows/{workflow_name}/steps/",
        deployment_topology_prefix(deployment_id)
    )
}

pub fn workflow_step_prefix(deployment_id: &str, workflow_name: &str, step_name: &str) -> String {
    format!(
        "{}/workflows/{workflow_name}/steps/{step_name}",
        deployment_topology_prefix(deployment_id)
    )
}

pub fn workflow_step_node(deployment_id: &str, workflow_name: &str, step_name: &str) -> String {
    format!("{}/node", workflow_step_prefix(deployment_id, workflow_name, step_name))
}

/// Requirement index of the relationship a step's activities operate
/// against, when `operation_host` redirects dispatch to the relationship
/// target (§4.6.2, §4.6.4). Absent for plain node-level steps.
pub fn workflow_step_requirement_index(deployment_id: &str, workflow_name: &str, step_name: &str) -> String {
    format!(
        "{}/requirement_index",
        workflow_step_prefix(deployment_id, workflow_name, step_name)
    )
}

/// The root step names of a workflow definition, stored as a JSON array
/// alongside its steps.
pub fn workflow_roots(deployment_id: &str, workflow_name: &str) -> String {
    format!(
        "{}/workflows/{workflow_name}/roots",
        deployment_topology_prefix(deployment_id)
    )
}

/// A task's own metadata (type, affected nodes, workflow name, status),
/// distinct from its per-step statuses under `workflow_step_status`.
pub fn task(task_id: &str) -> String {
    format!("_yorc/tasks/{task_id}")
}

pub fn workflow_step_operation_host(deployment_id: &str, workflow_name: &str, step_name: &str) -> String {
    format!(
        "{}/operation_host",
        workflow_step_prefix(deployment_id, workflow_name, step_name)
    )
}

pub fn workflow_step_target_relationship(deployment_id: &str, workflow_name: &str, step_name: &str) -> String {
    format!(
        "{}/target_relationship",
        workflow_step_prefix(deployment_id, workflow_name, step_name)
    )
}

pub fn workflow_step_async_marker(deployment_id: &str, workflow_name: &str, step_name: &str) -> String {
    format!("{}/async", workflow_step_prefix(deployment_id, workflow_name, step_name))
}

pub fn workflow_step_activity_prefix(deployment_id: &str, workflow_name: &str, step_name: &str) -> String {
    format!(
        "{}/activity/",
        workflow_step_prefix(deployment_id, workflow_name, step_name)
    )
}

pub fn workflow_step_next_prefix(deployment_id: &str, workflow_name: &str, step_name: &str) -> String {
    format!("{}/next/", workflow_step_prefix(deployment_id, workflow_name, step_name))
}

pub fn hosts_pool_host_prefix(location: &str, host: &str) -> String {
    format!("_yorc/hosts_pool/{location}/{host}")
}

pub fn hosts_pool_label(location: &str, host: &str, label: &str) -> String {
    format!("{}/labels/{label}", hosts_pool_host_prefix(location, host))
}

pub fn monitoring_report_status(check_id: &str) -> String {
    format!("_yorc/monitoring/reports/{check_id}/status")
}

/// `"<deploymentId>:<node>:<instance>"`. Rejects any other number of
/// colon-separated parts.
pub fn check_id(deployment_id: &str, node: &str, instance: &str) -> String {
    format!("{deployment_id}:{node}:{instance}")
}

pub fn parse_check_id(id: &str) -> Result<(String, String, String), MalformedPath> {
    let parts: Vec<&str> = id.split(':').collect();
    match parts.as_slice() {
        [dep, node, instance] => Ok((dep.to_string(), node.to_string(), instance.to_string())),
        _ => Err(MalformedPath(format!("malformed check ID {id:?}"))),
    }
}

/// The decomposition of an attribute (or capability / relationship
/// attribute) key, as produced by parsing one of the three recognized
/// path shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeData {
    pub deployment_id: String,
    pub node_name: String,
    pub instance_name: String,
    pub requirement_index: Option<String>,
    pub capability_name: Option<String>,
    pub attribute: String,
}

impl AttributeData {
    /// Rebuilds the exact path this was parsed from. The shape is
    /// determined by which optional fields are set: relationship instance
    /// paths take `requirement_index`, capability paths take
    /// `capability_name`, otherwise the plain node-instance shape.
    pub fn path(&self) -> String {
        if let Some(idx) = &self.requirement_index {
            relationship_instance_attribute(
                &self.deployment_id,
                &self.node_name,
                idx,
                &self.instance_name,
                &self.attribute,
            )
        } else if let Some(cap) = &self.capability_name {
            capability_attribute(
                &self.deployment_id,
                &self.node_name,
                &self.instance_name,
                cap,
                &self.attribute,
            )
        } else {
            node_instance_attribute(
                &self.deployment_id,
                &self.node_name,
                &self.instance_name,
                &self.attribute,
            )
        }
    }

    /// The notification-value encoding used under a source key's
    /// `attribute_notifications/<attr>` subtree: `"<node>/<instance>/attributes/<attr>"`
    /// or the capability variant.
    pub fn notification_value(&self) -> String {
        match &self.capability_name {
            Some(cap) => format!(
                "{}/{}/capabilities/{}/attributes/{}",
                self.node_name, self.instance_name, cap, self.attribute
            ),
            None => format!(
                "{}/{}/attributes/{}",
                self.node_name, self.instance_name, self.attribute
            ),
        }
    }
}

/// Inverse of [`AttributeData::notification_value`]: decodes a
/// `"<node>/<instance>/attributes/<attr>"` or
/// `"<node>/<instance>/capabilities/<cap>/attributes/<attr>"` dependent
/// address. Any other number of path segments is **malformed-path**.
pub fn decode_notification_value(deployment_id: &str, raw: &str) -> Result<AttributeData, MalformedPath> {
    let parts: Vec<&str> = raw.split('/').collect();
    match parts.as_slice() {
        [node, instance, "attributes", attr] => Ok(AttributeData {
            deployment_id: deployment_id.to_string(),
            node_name: (*node).to_string(),
            instance_name: (*instance).to_string(),
            requirement_index: None,
            capability_name: None,
            attribute: (*attr).to_string(),
        }),
        [node, instance, "capabilities", cap, "attributes", attr] => Ok(AttributeData {
            deployment_id: deployment_id.to_string(),
            node_name: (*node).to_string(),
            instance_name: (*instance).to_string(),
            requirement_index: None,
            capability_name: Some((*cap).to_string()),
            attribute: (*attr).to_string(),
        }),
        _ => Err(MalformedPath(format!("unexpected notification value shape {raw:?}"))),
    }
}

fn relationship_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^_yorc/deployments/(?P<dep>[^/]+)/topology/relationship_instances/(?P<node>[^/]+)/(?P<reqidx>[^/]+)/(?P<instance>[^/]+)/attributes/(?P<attr>.+)$",
        )
        .expect("static regex")
    })
}

fn capability_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^_yorc/deployments/(?P<dep>[^/]+)/topology/instances/(?P<node>[^/]+)/(?P<instance>[^/]+)/capabilities/(?P<cap>[^/]+)/attributes/(?P<attr>.+)$",
        )
        .expect("static regex")
    })
}

fn node_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^_yorc/deployments/(?P<dep>[^/]+)/topology/instances/(?P<node>[^/]+)/(?P<instance>[^/]+)/attributes/(?P<attr>.+)$",
        )
        .expect("static regex")
    })
}

/// Recognizes exactly the three shapes named in §6; anything else is
/// **malformed-path**.
pub fn parse_attribute_path(path: &str) -> Result<AttributeData, MalformedPath> {
    if let Some(caps) = relationship_regex().captures(path) {
        return Ok(AttributeData {
            deployment_id: caps["dep"].to_string(),
            node_name: caps["node"].to_string(),
            instance_name: caps["instance"].to_string(),
            requirement_index: Some(caps["reqidx"].to_string()),
            capability_name: None,
            attribute: caps["attr"].to_string(),
        });
    }
    if let Some(caps) = capability_regex().captures(path) {
        return Ok(AttributeData {
            deployment_id: caps["dep"].to_string(),
            node_name: caps["node"].to_string(),
            instance_name: caps["instance"].to_string(),
            requirement_index: None,
            capability_name: Some(caps["cap"].to_string()),
            attribute: caps["attr"].to_string(),
        });
    }
    if let Some(caps) = node_regex().captures(path) {
        return Ok(AttributeData {
            deployment_id: caps["dep"].to_string(),
            node_name: caps["node"].to_string(),
            instance_name: caps["instance"].to_string(),
            requirement_index: None,
            capability_name: None,
            attribute: caps["attr"].to_string(),
        });
    }
    Err(MalformedPath(path.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_plain_node_attribute() {
        let data = AttributeData {
            deployment_id: "dep1".into(),
            node_name: "Web".into(),
            instance_name: "0".into(),
            requirement_index: None,
            capability_name: None,
            attribute: "ip_address".into(),
        };
        let parsed = parse_attribute_path(&data.path()).unwrap();
        assert_eq!(parsed, data);
    }

    #[test]
    fn round_trips_capability_attribute() {
        let data = AttributeData {
            deployment_id: "dep1".into(),
            node_name: "App".into(),
            instance_name: "0".into(),
            requirement_index: None,
            capability_name: Some("connection".into()),
            attribute: "ip_address".into(),
        };
        let parsed = parse_attribute_path(&data.path()).unwrap();
        assert_eq!(parsed, data);
    }

    #[test]
    fn round_trips_relationship_attribute() {
        let data = AttributeData {
            deployment_id: "dep1".into(),
            node_name: "App".into(),
            instance_name: "0".into(),
            requirement_index: Some("0".into()),
            capability_name: None,
            attribute: "state".into(),
        };
        let parsed = parse_attribute_path(&data.path()).unwrap();
        assert_eq!(parsed, data);
    }

    #[test]
    fn rejects_unrecognized_shape() {
        assert!(parse_attribute_path("_yorc/deployments/dep1/topology/nodes/Web").is_err());
    }

    #[test]
    fn notification_value_roundtrips() {
        let data = AttributeData {
            deployment_id: "dep1".into(),
            node_name: "App".into(),
            instance_name: "0".into(),
            requirement_index: None,
            capability_name: Some("connection".into()),
            attribute: "ip_address".into(),
        };
        let encoded = data.notification_value();
        let decoded = decode_notification_value("dep1", &encoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn check_id_roundtrips_and_rejects_wrong_arity() {
        let id = check_id("dep1", "Web", "0");
        assert_eq!(parse_check_id(&id).unwrap(), ("dep1".into(), "Web".into(), "0".into()));
        assert!(parse_check_id("dep1:Web").is_err());
        assert!(parse_check_id("dep1:Web:0:extra").is_err());
    }
}
