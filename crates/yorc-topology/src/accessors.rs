//! Topology Model Accessors (§4.2): side-effect-free reads over the
//! coordination store. Type and node-template records are loaded by an
//! out-of-scope topology parser and stored as JSON blobs under the
//! `topology/types/<name>` and `topology/nodes/<name>` prefixes; this
//! crate only reads them back.

use async_recursion::async_recursion;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use yorc_kv::{paths, KvError, KvStore};

use crate::model::{CapabilityTemplate, NodeTemplate, TypeRecord};

pub const HOSTED_ON_TYPE: &str = "tosca.relationships.HostedOn";
pub const COMPUTE_TYPE: &str = "tosca.nodes.Compute";
pub const ENDPOINT_TYPE: &str = "tosca.capabilities.Endpoint";

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error(transparent)]
    Kv(#[from] KvError),

    #[error("malformed property: {0}")]
    MalformedProperty(String),

    #[error("node {0} not found")]
    NodeNotFound(String),

    #[error("type {0} not found")]
    TypeNotFound(String),

    #[error("requirement {requirement:?} of node {node} lacks its relationship or node entry")]
    MissingRequirementField { node: String, requirement: String },
}

pub struct TopologyStore<S: KvStore> {
    store: Arc<S>,
    deployment_id: String,
}

impl<S: KvStore> TopologyStore<S> {
    pub fn new(store: Arc<S>, deployment_id: impl Into<String>) -> Self {
        Self {
            store,
            deployment_id: deployment_id.into(),
        }
    }

    fn types_key(&self, type_name: &str) -> String {
        format!(
            "{}/types/{type_name}",
            paths::deployment_topology_prefix(&self.deployment_id)
        )
    }

    fn nodes_key(&self, node: &str) -> String {
        format!(
            "{}/nodes/{node}",
            paths::deployment_topology_prefix(&self.deployment_id)
        )
    }

    pub async fn get_type(&self, type_name: &str) -> Result<Option<TypeRecord>, TopologyError> {
        match self.store.get(&self.types_key(type_name)).await? {
            Some(pair) => Ok(Some(
                serde_json::from_slice(&pair.value)
                    .map_err(|e| TopologyError::MalformedProperty(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    pub async fn get_node_template(
        &self,
        node: &str,
    ) -> Result<Option<NodeTemplate>, TopologyError> {
        match self.store.get(&self.nodes_key(node)).await? {
            Some(pair) => Ok(Some(
                serde_json::from_slice(&pair.value)
                    .map_err(|e| TopologyError::MalformedProperty(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    async fn require_type(&self, type_name: &str) -> Result<TypeRecord, TopologyError> {
        self.get_type(type_name)
            .await?
            .ok_or_else(|| TopologyError::TypeNotFound(type_name.to_string()))
    }

    async fn require_node(&self, node: &str) -> Result<NodeTemplate, TopologyError> {
        self.get_node_template(node)
            .await?
            .ok_or_else(|| TopologyError::NodeNotFound(node.to_string()))
    }

    /// Direct ancestor, or `None` if `typeName` has no `derived_from` or
    /// does not exist.
    pub async fn parent_type(&self, type_name: &str) -> Result<Option<String>, TopologyError> {
        Ok(self
            .get_type(type_name)
            .await?
            .and_then(|t| t.derived_from))
    }

    /// Follows the `derived_from` chain from `type_name` looking for
    /// `candidate`. A type trivially derives from itself.
    pub async fn type_derives_from(
        &self,
        type_name: &str,
        candidate: &str,
    ) -> Result<bool, TopologyError> {
        let mut current = type_name.to_string();
        loop {
            if current == candidate {
                return Ok(true);
            }
            match self.parent_type(&current).await? {
                Some(parent) => current = parent,
                None => return Ok(false),
            }
        }
    }

    /// Whether `type_name` (or, if `search_hierarchy`, some ancestor)
    /// declares attribute `name`.
    pub async fn type_has_attribute(
        &self,
        type_name: &str,
        name: &str,
        search_hierarchy: bool,
    ) -> Result<bool, TopologyError> {
        let mut current = type_name.to_string();
        loop {
            let Some(record) = self.get_type(&current).await? else {
                return Ok(false);
            };
            if record.attributes.contains_key(name) {
                return Ok(true);
            }
            if !search_hierarchy {
                return Ok(false);
            }
            match record.derived_from {
                Some(parent) => current = parent,
                None => return Ok(false),
            }
        }
    }

    /// First default found walking the hierarchy, plus whether it is a
    /// function (as opposed to a literal).
    pub async fn type_default_attribute(
        &self,
        type_name: &str,
        name: &str,
    ) -> Result<Option<(String, bool)>, TopologyError> {
        self.type_default_field(type_name, name, false).await
    }

    pub async fn type_default_property(
        &self,
        type_name: &str,
        name: &str,
    ) -> Result<Option<(String, bool)>, TopologyError> {
        self.type_default_field(type_name, name, true).await
    }

    async fn type_default_field(
        &self,
        type_name: &str,
        name: &str,
        is_property: bool,
    ) -> Result<Option<(String, bool)>, TopologyError> {
        let mut current = type_name.to_string();
        loop {
            let Some(record) = self.get_type(&current).await? else {
                return Ok(None);
            };
            let fields = if is_property {
                &record.properties
            } else {
                &record.attributes
            };
            if let Some(field) = fields.get(name) {
                if let Some(default) = &field.default {
                    return Ok(Some((default.clone(), yorc_expr::is_function(default))));
                }
            }
            match record.derived_from {
                Some(parent) => current = parent,
                None => return Ok(None),
            }
        }
    }

    /// The node named by the first requirement whose relationship derives
    /// from `HostedOn`; `None` if no requirement does.
    pub async fn hosted_on(&self, node: &str) -> Result<Option<String>, TopologyError> {
        let template = self.require_node(node).await?;
        for req in &template.requirements {
            let Some(relationship) = &req.relationship else {
                continue;
            };
            if self.type_derives_from(relationship, HOSTED_ON_TYPE).await? {
                return req.node.clone().ok_or_else(|| {
                    TopologyError::MissingRequirementField {
                        node: node.to_string(),
                        requirement: req.name.clone(),
                    }
                }).map(Some);
            }
        }
        Ok(None)
    }

    /// Ordered instance ids for `node`, derived from the instance
    /// attribute subtree's immediate children.
    pub async fn instances_of(&self, node: &str) -> Result<Vec<String>, TopologyError> {
        let prefix = format!(
            "{}/instances/{node}/",
            paths::deployment_topology_prefix(&self.deployment_id)
        );
        let pairs = self.store.list_by_prefix(&prefix).await?;
        let mut ids: Vec<String> = pairs
            .into_iter()
            .filter_map(|p| {
                p.key
                    .trim_start_matches(&prefix)
                    .split('/')
                    .next()
                    .map(str::to_string)
            })
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    /// If the node's type derives from Compute, `scalable.default_instances`
    /// (defaulting to 1, **malformed-property** outside `u32` range); else
    /// recurse into `hostedOn`; else 1.
    #[async_recursion]
    pub async fn nb_instances(&self, node: &str) -> Result<u32, TopologyError>
    where
        S: 'async_recursion,
    {
        let template = self.require_node(node).await?;
        if self.type_derives_from(&template.type_name, COMPUTE_TYPE).await? {
            return match template
                .capabilities
                .get("scalable")
                .and_then(|c| c.properties.get("default_instances"))
            {
                Some(raw) => raw
                    .parse::<u32>()
                    .map_err(|_| TopologyError::MalformedProperty(format!(
                        "scalable.default_instances {raw:?} is not a valid u32"
                    ))),
                None => Ok(1),
            };
        }
        match self.hosted_on(node).await? {
            Some(host) => self.nb_instances(&host).await,
            None => Ok(1),
        }
    }

    /// Walks `hostedOn` upward; the first ancestor defining `attr` wins;
    /// if none do, the topmost ancestor (the Compute) wins.
    pub async fn resolve_host_notifier(
        &self,
        node: &str,
        attr: &str,
    ) -> Result<String, TopologyError> {
        let mut current = node.to_string();
        loop {
            let Some(next) = self.hosted_on(&current).await? else {
                return Ok(current);
            };
            let next_template = self.require_node(&next).await?;
            if self
                .type_has_attribute(&next_template.type_name, attr, true)
                .await?
            {
                return Ok(next);
            }
            current = next;
        }
    }

    pub async fn is_node_capability_of_type(
        &self,
        node: &str,
        cap_name: &str,
        cap_type: &str,
    ) -> Result<bool, TopologyError> {
        let template = self.require_node(node).await?;
        match template.capabilities.get(cap_name) {
            Some(cap) => self.type_derives_from(&cap.type_name, cap_type).await,
            None => Ok(false),
        }
    }

    /// `private_address` or `public_address` (plus a network name for a
    /// custom network) depending on the endpoint capability's
    /// `network_name` setting (defaulting to `PRIVATE`).
    pub async fn endpoint_capability_host_ip_attribute(
        &self,
        node: &str,
        cap_name: &str,
    ) -> Result<(String, Option<String>), TopologyError> {
        let template = self.require_node(node).await?;
        let network = template
            .capabilities
            .get(cap_name)
            .and_then(|c| c.properties.get("network_name"))
            .cloned()
            .unwrap_or_else(|| "PRIVATE".to_string());
        Ok(match network.to_uppercase().as_str() {
            "PRIVATE" => ("private_address".to_string(), None),
            "PUBLIC" => ("public_address".to_string(), None),
            _ => ("private_address".to_string(), Some(network)),
        })
    }

    /// Template literal value for `attr`, if the node template overrides
    /// it directly (step 3 of §4.4.1).
    pub async fn node_template_attribute(
        &self,
        node: &str,
        attr: &str,
    ) -> Result<Option<String>, TopologyError> {
        Ok(self
            .require_node(node)
            .await?
            .attributes
            .get(attr)
            .cloned())
    }

    pub async fn node_template_property(
        &self,
        node: &str,
        name: &str,
    ) -> Result<Option<String>, TopologyError> {
        Ok(self
            .require_node(node)
            .await?
            .properties
            .get(name)
            .cloned())
    }

    pub async fn node_capability_template_attribute(
        &self,
        node: &str,
        cap_name: &str,
        attr: &str,
    ) -> Result<Option<String>, TopologyError> {
        Ok(self
            .require_node(node)
            .await?
            .capabilities
            .get(cap_name)
            .and_then(|c: &CapabilityTemplate| c.attributes.get(attr).cloned()))
    }

    /// Template literal → type default (hierarchy) → host-chain
    /// inheritance, mirroring §4.4.1 but for static properties.
    #[async_recursion]
    pub async fn get_node_property(&self, node: &str, name: &str) -> Result<Option<String>, TopologyError>
    where
        S: 'async_recursion,
    {
        let template = self.require_node(node).await?;
        if let Some(literal) = template.properties.get(name) {
            if !yorc_expr::is_function(literal) {
                return Ok(Some(literal.clone()));
            }
        }
        if let Some((default, is_function)) =
            self.type_default_property(&template.type_name, name).await?
        {
            if !is_function {
                return Ok(Some(default));
            }
        }
        match self.hosted_on(node).await? {
            Some(host) => self.get_node_property(&host, name).await,
            None => Ok(None),
        }
    }

    /// All node names known to the deployment.
    pub async fn get_nodes(&self) -> Result<Vec<String>, TopologyError> {
        let prefix = format!(
            "{}/nodes/",
            paths::deployment_topology_prefix(&self.deployment_id)
        );
        let pairs = self.store.list_by_prefix(&prefix).await?;
        Ok(pairs
            .into_iter()
            .map(|p| p.key.trim_start_matches(&prefix).to_string())
            .collect())
    }

    pub async fn put_type(&self, record: &TypeRecord) -> Result<(), TopologyError> {
        let bytes = serde_json::to_vec(record)
            .map_err(|e| TopologyError::MalformedProperty(e.to_string()))?;
        self.store.put(&self.types_key(&record.name), bytes).await?;
        Ok(())
    }

    pub async fn put_node_template(&self, template: &NodeTemplate) -> Result<(), TopologyError> {
        let bytes = serde_json::to_vec(template)
            .map_err(|e| TopologyError::MalformedProperty(e.to_string()))?;
        self.store.put(&self.nodes_key(&template.name), bytes).await?;
        Ok(())
    }

    /// Records `(node, instance)` as the external view of a composite
    /// sub-deployment (§3 "Substitution Mapping").
    pub async fn mark_substitution_instance(&self, node: &str, instance: &str) -> Result<(), TopologyError> {
        self.store
            .put(
                &paths::substitution_instance_marker(&self.deployment_id, node, instance),
                b"1".to_vec(),
            )
            .await?;
        Ok(())
    }

    pub async fn is_substitution_instance(&self, node: &str, instance: &str) -> Result<bool, TopologyError> {
        Ok(self
            .store
            .get(&paths::substitution_instance_marker(&self.deployment_id, node, instance))
            .await?
            .is_some())
    }

    /// Substitution mappings are stored as a flat JSON map of
    /// `"<capability>.<attr>"` → target, under
    /// `topology/substitution_mappings/<node>`.
    pub async fn substitution_mapping(
        &self,
        node: &str,
        exposed_key: &str,
    ) -> Result<Option<crate::model::SubstitutionMappingAttribute>, TopologyError> {
        let key = format!(
            "{}/substitution_mappings/{node}",
            paths::deployment_topology_prefix(&self.deployment_id)
        );
        let Some(pair) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let all: HashMap<String, crate::model::SubstitutionMappingAttribute> =
            serde_json::from_slice(&pair.value)
                .map_err(|e| TopologyError::MalformedProperty(e.to_string()))?;
        Ok(all.get(exposed_key).cloned())
    }
}
