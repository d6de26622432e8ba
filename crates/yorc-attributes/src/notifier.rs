//! The polymorphic notifier (§9 design note): a tagged variant over the
//! two kinds of source a dependent attribute can watch — a concrete
//! attribute (plain or on a capability) or an operation output.

use yorc_kv::{paths, KvError, KvStore, TxnOp};

/// A source the notification graph can watch. Mirrors the Go
/// original's `AttributeNotifier` / `OperationOutputNotifier`, unified
/// behind one type instead of an interface with two implementations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notifier {
    Attribute {
        node: String,
        instance: String,
        capability: Option<String>,
        attribute: String,
    },
    OperationOutput {
        node: String,
        instance: String,
        interface: String,
        operation: String,
        output: String,
    },
}

impl Notifier {
    /// The KV prefix edges for this notifier are recorded under (§6:
    /// `<sourceKey>/attribute_notifications/<attr>/<index>`).
    fn source_key(&self, deployment_id: &str) -> String {
        match self {
            Notifier::Attribute {
                node,
                instance,
                capability: Some(cap),
                ..
            } => paths::capability_prefix(deployment_id, node, instance, cap),
            Notifier::Attribute { node, instance, .. } => {
                paths::node_instance_prefix(deployment_id, node, instance)
            }
            Notifier::OperationOutput {
                node,
                instance,
                interface,
                operation,
                ..
            } => paths::operation_prefix(deployment_id, node, instance, interface, operation),
        }
    }

    /// The attribute/output name segment of the notification path.
    fn label(&self) -> &str {
        match self {
            Notifier::Attribute { attribute, .. } => attribute,
            Notifier::OperationOutput { output, .. } => output,
        }
    }
}

/// Appends a notification edge from `notifier` to `dependent`, as a
/// monotonically indexed child under the notifier's source key (§4.4.4).
/// Returns without writing if an identical edge is already recorded, so
/// re-running the wiring walk for an unrelated attribute is idempotent.
pub async fn save_notification<S: KvStore>(
    store: &S,
    deployment_id: &str,
    notifier: &Notifier,
    dependent: &paths::AttributeData,
) -> Result<(), KvError> {
    let prefix = paths::notification_edge_prefix(&notifier.source_key(deployment_id), notifier.label());
    let existing = store.list_by_prefix(&prefix).await?;
    let value = dependent.notification_value();
    if existing
        .iter()
        .any(|pair| pair.value == value.clone().into_bytes())
    {
        return Ok(());
    }
    let index = existing.len() as u64;
    let key = paths::notification_edge(&notifier.source_key(deployment_id), notifier.label(), index);
    store
        .transact(vec![TxnOp::Put {
            key,
            value: value.into_bytes(),
        }])
        .await
}

/// Every dependent currently registered at `notifier`'s source key.
pub async fn list_dependents<S: KvStore>(
    store: &S,
    deployment_id: &str,
    notifier: &Notifier,
) -> Result<Vec<paths::AttributeData>, KvError> {
    let prefix = paths::notification_edge_prefix(&notifier.source_key(deployment_id), notifier.label());
    let pairs = store.list_by_prefix(&prefix).await?;
    let mut out = Vec::with_capacity(pairs.len());
    for pair in pairs {
        let raw = String::from_utf8_lossy(&pair.value);
        if let Ok(data) = paths::decode_notification_value(deployment_id, &raw) {
            out.push(data);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use yorc_kv::InMemoryKvStore;

    #[tokio::test]
    async fn save_then_list_round_trips() {
        let store = InMemoryKvStore::new();
        let notifier = Notifier::Attribute {
            node: "Compute".into(),
            instance: "0".into(),
            capability: None,
            attribute: "private_address".into(),
        };
        let dependent = paths::AttributeData {
            deployment_id: "dep1".into(),
            node_name: "App".into(),
            instance_name: "0".into(),
            requirement_index: None,
            capability_name: Some("connection".into()),
            attribute: "ip_address".into(),
        };
        save_notification(&store, "dep1", &notifier, &dependent).await.unwrap();
        let deps = list_dependents(&store, "dep1", &notifier).await.unwrap();
        assert_eq!(deps, vec![dependent]);
    }

    #[tokio::test]
    async fn duplicate_notification_is_not_double_recorded() {
        let store = InMemoryKvStore::new();
        let notifier = Notifier::Attribute {
            node: "Compute".into(),
            instance: "0".into(),
            capability: None,
            attribute: "private_address".into(),
        };
        let dependent = paths::AttributeData {
            deployment_id: "dep1".into(),
            node_name: "App".into(),
            instance_name: "0".into(),
            requirement_index: None,
            capability_name: None,
            attribute: "ip_address".into(),
        };
        save_notification(&store, "dep1", &notifier, &dependent).await.unwrap();
        save_notification(&store, "dep1", &notifier, &dependent).await.unwrap();
        let deps = list_dependents(&store, "dep1", &notifier).await.unwrap();
        assert_eq!(deps.len(), 1);
    }
}
