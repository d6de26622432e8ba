//! Attribute resolution (§4.4.1–4.4.3, 4.4.5, 4.4.6).
//!
//! [`AttributeResolver::value_of`] is both a reader and a writer: the
//! first time an attribute's value is asked for, the same walk that
//! resolves it also wires the notification edges a future change at one
//! of its sources needs to find it again.

use std::sync::Arc;

use async_recursion::async_recursion;
use chrono::Utc;
use thiserror::Error;

use yorc_expr::{MalformedExpression, ParsedValue, GET_ATTRIBUTE, GET_OPERATION_OUTPUT};
use yorc_kv::events::{AttributeChangeStatus, Event, EventKind, EventLevel, EventPublisher};
use yorc_kv::paths::{AttributeData, MalformedPath};
use yorc_kv::{KvError, KvStore};
use yorc_topology::{TopologyError, TopologyStore, ENDPOINT_TYPE};

use crate::notifier::{list_dependents, save_notification, Notifier};

#[derive(Debug, Error)]
pub enum AttributeError {
    #[error(transparent)]
    Kv(#[from] KvError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Expression(#[from] MalformedExpression),

    #[error(transparent)]
    Path(#[from] MalformedPath),

    /// A function refers to a node, type or capability that does not exist.
    #[error("unresolved reference: {0}")]
    UnresolvedReference(String),
}

pub struct AttributeResolver<S: KvStore> {
    store: Arc<S>,
    topology: TopologyStore<S>,
    events: Arc<dyn EventPublisher>,
    deployment_id: String,
}

impl<S: KvStore> AttributeResolver<S> {
    pub fn new(store: Arc<S>, deployment_id: impl Into<String>, events: Arc<dyn EventPublisher>) -> Self {
        let deployment_id = deployment_id.into();
        let topology = TopologyStore::new(store.clone(), deployment_id.clone());
        Self {
            store,
            topology,
            events,
            deployment_id,
        }
    }

    /// Resolution order for a plain node attribute (§4.4.1, steps 1-6).
    #[async_recursion]
    pub async fn value_of(&self, node: &str, instance: &str, attr: &str) -> Result<Option<String>, AttributeError>
    where
        S: 'async_recursion,
    {
        let dependent = self.attribute_data(node, instance, None, attr);

        if self.topology.is_substitution_instance(node, instance).await? {
            if let Some(value) = self.read_raw(&dependent).await? {
                self.publish(&dependent, &value, AttributeChangeStatus::Updated).await;
                return Ok(Some(value));
            }
        }

        if attr.contains('.') {
            if let Some(value) = self.resolve_substitution_mapping(node, instance, attr).await? {
                return Ok(Some(value));
            }
        }

        if let Some(literal) = self.topology.node_template_attribute(node, attr).await? {
            if !yorc_expr::is_function(&literal) {
                return Ok(Some(literal));
            }
        }

        if let Some(value) = self.read_raw(&dependent).await? {
            return Ok(Some(value));
        }

        let template = self.require_node_template(node).await?;
        if let Some((default, is_function)) =
            self.topology.type_default_attribute(&template.type_name, attr).await?
        {
            if !is_function {
                self.publish(&dependent, &default, AttributeChangeStatus::Default).await;
                return Ok(Some(default));
            }
            self.parse_function(&default, &dependent).await?;
            if let Some(value) = self.read_raw(&dependent).await? {
                return Ok(Some(value));
            }
        }

        match self.topology.hosted_on(node).await? {
            Some(host) => self.value_of(&host, instance, attr).await,
            None => Ok(None),
        }
    }

    /// Resolution order for a capability attribute: the same chain minus
    /// the node-level-only steps 1 and 2.
    #[async_recursion]
    pub async fn capability_value_of(
        &self,
        node: &str,
        instance: &str,
        capability: &str,
        attr: &str,
    ) -> Result<Option<String>, AttributeError>
    where
        S: 'async_recursion,
    {
        let dependent = self.attribute_data(node, instance, Some(capability), attr);

        if let Some(literal) = self
            .topology
            .node_capability_template_attribute(node, capability, attr)
            .await?
        {
            if !yorc_expr::is_function(&literal) {
                return Ok(Some(literal));
            }
        }

        if let Some(value) = self.read_raw(&dependent).await? {
            return Ok(Some(value));
        }

        let template = self.require_node_template(node).await?;
        if let Some(cap_template) = template.capabilities.get(capability) {
            if let Some((default, is_function)) = self
                .topology
                .type_default_attribute(&cap_template.type_name, attr)
                .await?
            {
                if !is_function {
                    self.publish(&dependent, &default, AttributeChangeStatus::Default).await;
                    return Ok(Some(default));
                }
                self.parse_function(&default, &dependent).await?;
                if let Some(value) = self.read_raw(&dependent).await? {
                    return Ok(Some(value));
                }
            }
        }

        match self.topology.hosted_on(node).await? {
            Some(host) => self.capability_value_of(&host, instance, capability, attr).await,
            None => Ok(None),
        }
    }

    /// §4.4.3: the exposed key `<cap>.<attr>` is itself shaped like a
    /// capability attribute on the substituted node — `cap` is the
    /// substitution's own capability name, `attr` the name consumers ask
    /// for. The mapping only says which node/attribute actually supplies
    /// the value, which may live on the node itself or anywhere up its
    /// host chain, so that value is wired the same way the Endpoint
    /// `ip_address` redirect is: an edge at every host-chain ancestor
    /// declaring the source attribute, plus one at the mapped node/attribute
    /// in case it is ever written there directly. The result is read back
    /// through the exposed capability attribute, never the internal one.
    async fn resolve_substitution_mapping(
        &self,
        node: &str,
        instance: &str,
        exposed_attr: &str,
    ) -> Result<Option<String>, AttributeError> {
        let Some((exposed_cap, exposed_name)) = exposed_attr.split_once('.') else {
            return Ok(None);
        };
        let Some(mapping) = self.topology.substitution_mapping(node, exposed_attr).await? else {
            return Ok(None);
        };
        let dependent = self.attribute_data(node, instance, Some(exposed_cap), exposed_name);

        self.wire_host_chain(&mapping.node_name, &mapping.attribute, &dependent).await?;
        if mapping.node_name != node || mapping.capability != exposed_cap || mapping.attribute != exposed_name {
            let notifier = Notifier::Attribute {
                node: mapping.node_name.clone(),
                instance: instance.to_string(),
                capability: Some(mapping.capability.clone()),
                attribute: mapping.attribute.clone(),
            };
            save_notification(self.store.as_ref(), &self.deployment_id, &notifier, &dependent).await?;
        }

        self.capability_value_of(node, instance, exposed_cap, exposed_name).await
    }

    /// §4.4.2: wires a notification edge for every `get_attribute` /
    /// `get_operation_output` sub-function found in `raw`, targeting
    /// `notified`. Does not itself resolve or publish a value.
    pub async fn parse_function(&self, raw: &str, notified: &AttributeData) -> Result<(), AttributeError> {
        let ParsedValue::Function(call) = yorc_expr::parse(raw)? else {
            return Ok(());
        };

        for ga_call in call.functions_by_operator(GET_ATTRIBUTE) {
            let ga = ga_call.as_get_attribute()?;
            match ga.notifier.as_str() {
                "SELF" => {
                    if let Some(cap) = &ga.capability {
                        if ga.attribute == "ip_address"
                            && self
                                .topology
                                .is_node_capability_of_type(&notified.node_name, cap, ENDPOINT_TYPE)
                                .await?
                        {
                            let (ip_attr, _network) = self
                                .topology
                                .endpoint_capability_host_ip_attribute(&notified.node_name, cap)
                                .await?;
                            self.wire_host_chain(&notified.node_name, &ip_attr, notified).await?;
                            continue;
                        }
                    }
                    let notifier = Notifier::Attribute {
                        node: notified.node_name.clone(),
                        instance: notified.instance_name.clone(),
                        capability: ga.capability.clone(),
                        attribute: ga.attribute.clone(),
                    };
                    save_notification(self.store.as_ref(), &self.deployment_id, &notifier, notified).await?;
                }
                "HOST" => {
                    let host = self
                        .topology
                        .resolve_host_notifier(&notified.node_name, &ga.attribute)
                        .await?;
                    let notifier = Notifier::Attribute {
                        node: host,
                        instance: notified.instance_name.clone(),
                        capability: ga.capability.clone(),
                        attribute: ga.attribute.clone(),
                    };
                    save_notification(self.store.as_ref(), &self.deployment_id, &notifier, notified).await?;
                }
                other => {
                    return Err(AttributeError::Expression(MalformedExpression(format!(
                        "unsupported get_attribute notifier keyword {other:?}"
                    ))));
                }
            }
        }

        for goo_call in call.functions_by_operator(GET_OPERATION_OUTPUT) {
            let goo = goo_call.as_get_operation_output()?;
            let notifier = Notifier::OperationOutput {
                node: notified.node_name.clone(),
                instance: notified.instance_name.clone(),
                interface: goo.interface,
                operation: goo.operation,
                output: goo.output,
            };
            save_notification(self.store.as_ref(), &self.deployment_id, &notifier, notified).await?;
        }

        Ok(())
    }

    /// Walks `hosted_on` from `node` upward, adding an edge to `dependent`
    /// at every ancestor whose type declares `attr` (§4.4.3).
    async fn wire_host_chain(&self, node: &str, attr: &str, dependent: &AttributeData) -> Result<(), AttributeError> {
        let mut current = node.to_string();
        loop {
            let Some(next) = self.topology.hosted_on(&current).await? else {
                return Ok(());
            };
            let next_template = self.require_node_template(&next).await?;
            if self
                .topology
                .type_has_attribute(&next_template.type_name, attr, true)
                .await?
            {
                let notifier = Notifier::Attribute {
                    node: next.clone(),
                    instance: dependent.instance_name.clone(),
                    capability: None,
                    attribute: attr.to_string(),
                };
                save_notification(self.store.as_ref(), &self.deployment_id, &notifier, dependent).await?;
            }
            current = next;
        }
    }

    /// §4.4.5: a notifier's current value is read once, then copied down
    /// to every dependent whose last-known value differs from it;
    /// each dependent that actually changes cascades its own
    /// `notify_value_change` in turn. This is the "steps 4 and below"
    /// restriction in practice: a dependent's recomputed value *is* the
    /// value now sitting at the source it was wired to, never a fresh
    /// independent walk of template/type-default/host-chain.
    #[async_recursion]
    pub async fn notify_value_change(&self, source: &Notifier) -> Result<(), AttributeError>
    where
        S: 'async_recursion,
    {
        let Some(value) = self.read_notifier_value(source).await? else {
            return Ok(());
        };
        let dependents = list_dependents(self.store.as_ref(), &self.deployment_id, source).await?;
        for dependent in dependents {
            self.propagate(&dependent, &value).await?;
        }
        Ok(())
    }

    #[async_recursion]
    async fn propagate(&self, dependent: &AttributeData, value: &str) -> Result<(), AttributeError>
    where
        S: 'async_recursion,
    {
        let old = self.read_raw(dependent).await?;
        if old.as_deref() == Some(value) {
            return Ok(());
        }
        self.store.put(&dependent.path(), value.as_bytes().to_vec()).await?;
        self.publish(dependent, value, AttributeChangeStatus::Updated).await;

        let notifier = Notifier::Attribute {
            node: dependent.node_name.clone(),
            instance: dependent.instance_name.clone(),
            capability: dependent.capability_name.clone(),
            attribute: dependent.attribute.clone(),
        };
        self.notify_value_change(&notifier).await
    }

    async fn read_notifier_value(&self, source: &Notifier) -> Result<Option<String>, AttributeError> {
        match source {
            Notifier::Attribute {
                node,
                instance,
                capability,
                attribute,
            } => {
                let data = self.attribute_data(node, instance, capability.as_deref(), attribute);
                self.read_raw(&data).await
            }
            Notifier::OperationOutput {
                node,
                instance,
                interface,
                operation,
                output,
            } => {
                let key = yorc_kv::paths::operation_output(&self.deployment_id, node, instance, interface, operation, output);
                match self.store.get(&key).await? {
                    Some(pair) => Ok(Some(String::from_utf8_lossy(&pair.value).into_owned())),
                    None => Ok(None),
                }
            }
        }
    }

    async fn read_raw(&self, data: &AttributeData) -> Result<Option<String>, AttributeError> {
        match self.store.get(&data.path()).await? {
            Some(pair) => Ok(Some(String::from_utf8_lossy(&pair.value).into_owned())),
            None => Ok(None),
        }
    }

    async fn require_node_template(&self, node: &str) -> Result<yorc_topology::NodeTemplate, AttributeError> {
        self.topology
            .get_node_template(node)
            .await?
            .ok_or_else(|| AttributeError::UnresolvedReference(format!("node {node} not found")))
    }

    fn attribute_data(
        &self,
        node: &str,
        instance: &str,
        capability: Option<&str>,
        attr: &str,
    ) -> AttributeData {
        AttributeData {
            deployment_id: self.deployment_id.clone(),
            node_name: node.to_string(),
            instance_name: instance.to_string(),
            requirement_index: None,
            capability_name: capability.map(str::to_string),
            attribute: attr.to_string(),
        }
    }

    /// §4.4.6: publish an `attribute-value-change` event.
    async fn publish(&self, data: &AttributeData, value: &str, status: AttributeChangeStatus) {
        self.events
            .publish(Event {
                timestamp: Utc::now(),
                level: EventLevel::Info,
                deployment: self.deployment_id.clone(),
                node: Some(data.node_name.clone()),
                instance: Some(data.instance_name.clone()),
                interface: None,
                operation: None,
                message: format!(
                    "attribute {} of {}/{} changed",
                    data.attribute, data.node_name, data.instance_name
                ),
                kind: EventKind::AttributeValueChange {
                    attribute: data.attribute.clone(),
                    value: value.to_string(),
                    status,
                },
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use yorc_kv::events::RecordingEventPublisher;
    use yorc_kv::InMemoryKvStore;
    use yorc_topology::{CapabilityTemplate, FieldDefinition, NodeTemplate, Requirement, TypeRecord, COMPUTE_TYPE, HOSTED_ON_TYPE};

    const ENDPOINT: &str = "tosca.capabilities.Endpoint";

    async fn seed_app_hosted_on_compute(store: Arc<InMemoryKvStore>) {
        let topo = TopologyStore::new(store, "dep1");
        topo.put_type(&TypeRecord {
            name: COMPUTE_TYPE.into(),
            derived_from: None,
            properties: HashMap::new(),
            attributes: [(
                "private_address".to_string(),
                FieldDefinition { default: None, type_name: "string".into(), required: false, entry_schema: None },
            ), (
                "public_address".to_string(),
                FieldDefinition { default: None, type_name: "string".into(), required: false, entry_schema: None },
            )]
            .into_iter()
            .collect(),
        })
        .await
        .unwrap();
        topo.put_type(&TypeRecord {
            name: HOSTED_ON_TYPE.into(),
            derived_from: None,
            properties: HashMap::new(),
            attributes: HashMap::new(),
        })
        .await
        .unwrap();
        topo.put_type(&TypeRecord {
            name: ENDPOINT.into(),
            derived_from: None,
            properties: HashMap::new(),
            attributes: HashMap::new(),
        })
        .await
        .unwrap();
        topo.put_type(&TypeRecord {
            name: "App".into(),
            derived_from: None,
            properties: HashMap::new(),
            attributes: HashMap::new(),
        })
        .await
        .unwrap();
        topo.put_node_template(&NodeTemplate {
            name: "Compute".into(),
            type_name: COMPUTE_TYPE.into(),
            ..Default::default()
        })
        .await
        .unwrap();
        topo.put_node_template(&NodeTemplate {
            name: "App".into(),
            type_name: "App".into(),
            requirements: vec![Requirement {
                name: "host".into(),
                node: Some("Compute".into()),
                relationship: Some(HOSTED_ON_TYPE.into()),
                capability: None,
            }],
            capabilities: [(
                "connection".to_string(),
                CapabilityTemplate {
                    type_name: ENDPOINT.into(),
                    properties: [("network_name".to_string(), "PRIVATE".to_string())].into_iter().collect(),
                    attributes: HashMap::new(),
                },
            )]
            .into_iter()
            .collect(),
            ..Default::default()
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn endpoint_ip_propagation() {
        let store = Arc::new(InMemoryKvStore::new());
        seed_app_hosted_on_compute(store.clone()).await;
        let events = Arc::new(RecordingEventPublisher::new());
        let resolver = AttributeResolver::new(store.clone(), "dep1", events.clone());

        let dependent = AttributeData {
            deployment_id: "dep1".into(),
            node_name: "App".into(),
            instance_name: "0".into(),
            requirement_index: None,
            capability_name: Some("connection".into()),
            attribute: "ip_address".into(),
        };
        resolver
            .parse_function(r#"{"get_attribute": ["SELF", "connection", "ip_address"]}"#, &dependent)
            .await
            .unwrap();

        let notifier = Notifier::Attribute {
            node: "Compute".into(),
            instance: "0".into(),
            capability: None,
            attribute: "private_address".into(),
        };
        store
            .put(
                &yorc_kv::paths::node_instance_attribute("dep1", "Compute", "0", "private_address"),
                b"10.0.0.5".to_vec(),
            )
            .await
            .unwrap();
        resolver.notify_value_change(&notifier).await.unwrap();

        let value = resolver.capability_value_of("App", "0", "connection", "ip_address").await.unwrap();
        assert_eq!(value.as_deref(), Some("10.0.0.5"));
        assert!(events.events().iter().any(|e| matches!(
            &e.kind,
            EventKind::AttributeValueChange { value, .. } if value == "10.0.0.5"
        )));
    }

    #[tokio::test]
    async fn substitution_mapping_host_chain_wires_both_ends() {
        let store = Arc::new(InMemoryKvStore::new());
        let topo = TopologyStore::new(store.clone(), "dep1");
        topo.put_type(&TypeRecord {
            name: COMPUTE_TYPE.into(),
            derived_from: None,
            properties: HashMap::new(),
            attributes: [(
                "public_address".to_string(),
                FieldDefinition { default: None, type_name: "string".into(), required: false, entry_schema: None },
            )]
            .into_iter()
            .collect(),
        })
        .await
        .unwrap();
        topo.put_type(&TypeRecord {
            name: HOSTED_ON_TYPE.into(),
            derived_from: None,
            properties: HashMap::new(),
            attributes: HashMap::new(),
        })
        .await
        .unwrap();
        topo.put_type(&TypeRecord {
            name: "Service".into(),
            derived_from: None,
            properties: HashMap::new(),
            attributes: HashMap::new(),
        })
        .await
        .unwrap();
        topo.put_node_template(&NodeTemplate {
            name: "Compute".into(),
            type_name: COMPUTE_TYPE.into(),
            ..Default::default()
        })
        .await
        .unwrap();
        topo.put_node_template(&NodeTemplate {
            name: "Service".into(),
            type_name: "Service".into(),
            requirements: vec![Requirement {
                name: "host".into(),
                node: Some("Compute".into()),
                relationship: Some(HOSTED_ON_TYPE.into()),
                capability: None,
            }],
            capabilities: [(
                "endpoint".to_string(),
                CapabilityTemplate {
                    type_name: ENDPOINT.into(),
                    properties: HashMap::new(),
                    attributes: HashMap::new(),
                },
            )]
            .into_iter()
            .collect(),
            ..Default::default()
        })
        .await
        .unwrap();

        let mut mappings = HashMap::new();
        mappings.insert(
            "endpoint.ip_address".to_string(),
            yorc_topology::SubstitutionMappingAttribute {
                node_name: "Service".into(),
                capability: "endpoint".into(),
                attribute: "public_address".into(),
            },
        );
        store
            .put(
                "_yorc/deployments/dep1/topology/substitution_mappings/Service",
                serde_json::to_vec(&mappings).unwrap(),
            )
            .await
            .unwrap();

        let events = Arc::new(RecordingEventPublisher::new());
        let resolver = AttributeResolver::new(store.clone(), "dep1", events.clone());

        resolver.value_of("Service", "0", "endpoint.ip_address").await.unwrap();

        let service_edges = list_dependents(
            &*store,
            "dep1",
            &Notifier::Attribute {
                node: "Service".into(),
                instance: "0".into(),
                capability: Some("endpoint".into()),
                attribute: "public_address".into(),
            },
        )
        .await
        .unwrap();
        assert_eq!(service_edges.len(), 1);

        let compute_edges = list_dependents(
            &*store,
            "dep1",
            &Notifier::Attribute {
                node: "Compute".into(),
                instance: "0".into(),
                capability: None,
                attribute: "public_address".into(),
            },
        )
        .await
        .unwrap();
        assert_eq!(compute_edges.len(), 1);

        store
            .put(
                &yorc_kv::paths::node_instance_attribute("dep1", "Compute", "0", "public_address"),
                b"1.2.3.4".to_vec(),
            )
            .await
            .unwrap();
        resolver
            .notify_value_change(&Notifier::Attribute {
                node: "Compute".into(),
                instance: "0".into(),
                capability: None,
                attribute: "public_address".into(),
            })
            .await
            .unwrap();

        let value = resolver.value_of("Service", "0", "endpoint.ip_address").await.unwrap();
        assert_eq!(value.as_deref(), Some("1.2.3.4"));
    }

    #[tokio::test]
    async fn same_value_recomputation_emits_nothing() {
        let store = Arc::new(InMemoryKvStore::new());
        seed_app_hosted_on_compute(store.clone()).await;
        let events = Arc::new(RecordingEventPublisher::new());
        let resolver = AttributeResolver::new(store.clone(), "dep1", events.clone());

        store
            .put(
                &yorc_kv::paths::node_instance_attribute("dep1", "Compute", "0", "private_address"),
                b"10.0.0.5".to_vec(),
            )
            .await
            .unwrap();
        store
            .put(
                &yorc_kv::paths::node_instance_attribute("dep1", "App", "0", "state"),
                b"10.0.0.5".to_vec(),
            )
            .await
            .unwrap();

        let notifier = Notifier::Attribute {
            node: "Compute".into(),
            instance: "0".into(),
            capability: None,
            attribute: "private_address".into(),
        };
        let dependent = AttributeData {
            deployment_id: "dep1".into(),
            node_name: "App".into(),
            instance_name: "0".into(),
            requirement_index: None,
            capability_name: None,
            attribute: "state".into(),
        };
        save_notification(&*store, "dep1", &notifier, &dependent).await.unwrap();

        resolver.notify_value_change(&notifier).await.unwrap();
        assert!(events.events().is_empty());
    }
}
