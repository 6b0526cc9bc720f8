//! Separation and filling of secret values carried inside batch/experiment
//! connector descriptors.
//!
//! A connector descriptor may hold a secret value wrapped as
//! `{"!secret": <value>}`. Separation replaces that wrapper in place with
//! `{"!secret_ref": "<uuid>"}` and lifts the original value out into a
//! side map, so the persisted document never carries secret material.
//! Filling reverses the substitution. Two structurally identical secret
//! values within one document collapse onto the same uuid.

use std::collections::HashMap;

use serde_json::Value;

use crate::model::{Batch, Experiment};

const SECRET_TAG: &str = "!secret";
const SECRET_REF_TAG: &str = "!secret_ref";

pub type SecretMap = HashMap<String, Value>;

struct Separator {
    secrets: SecretMap,
    reversed: HashMap<String, String>,
}

impl Separator {
    fn new() -> Self {
        Self {
            secrets: SecretMap::new(),
            reversed: HashMap::new(),
        }
    }

    fn walk(&mut self, value: &mut Value) {
        if let Value::Object(map) = value {
            if map.len() == 1 {
                if let Some(secret) = map.get(SECRET_TAG) {
                    let canonical = canonical_json(secret);
                    let uuid = self
                        .reversed
                        .entry(canonical)
                        .or_insert_with(|| uuid::Uuid::new_v4().to_string())
                        .clone();
                    self.secrets.entry(uuid.clone()).or_insert_with(|| secret.clone());
                    *value = serde_json::json!({ SECRET_REF_TAG: uuid });
                    return;
                }
            }
            for v in map.values_mut() {
                self.walk(v);
            }
        } else if let Value::Array(items) = value {
            for v in items {
                self.walk(v);
            }
        }
    }
}

/// Canonical form used to detect structurally-identical secrets: a JSON
/// string built from recursively key-sorted objects.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, String)> =
                map.iter().map(|(k, v)| (k, canonical_json(v))).collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let body = entries
                .into_iter()
                .map(|(k, v)| format!("{:?}:{}", k, v))
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{}}}", body)
        }
        Value::Array(items) => {
            let body = items.iter().map(canonical_json).collect::<Vec<_>>().join(",");
            format!("[{}]", body)
        }
        other => other.to_string(),
    }
}

fn collect_refs(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(Value::String(uuid)) = map.get(SECRET_REF_TAG) {
                    out.push(uuid.clone());
                    return;
                }
            }
            for v in map.values() {
                collect_refs(v, out);
            }
        }
        Value::Array(items) => {
            for v in items {
                collect_refs(v, out);
            }
        }
        _ => {}
    }
}

fn fill_refs(value: &mut Value, secrets: &SecretMap) -> Result<(), String> {
    match value {
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(Value::String(uuid)) = map.get(SECRET_REF_TAG) {
                    let secret = secrets
                        .get(uuid)
                        .ok_or_else(|| format!("missing secret for key {uuid}"))?
                        .clone();
                    *value = serde_json::json!({ SECRET_TAG: secret });
                    return Ok(());
                }
            }
            for v in map.values_mut() {
                fill_refs(v, secrets)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for v in items {
                fill_refs(v, secrets)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn separate_map(map: &mut serde_json::Map<String, Value>, sep: &mut Separator) {
    for v in map.values_mut() {
        sep.walk(v);
    }
}

pub fn separate_secrets_batch(batch: &mut Batch) -> SecretMap {
    let mut sep = Separator::new();
    separate_map(&mut batch.inputs, &mut sep);
    separate_map(&mut batch.outputs, &mut sep);
    sep.secrets
}

pub fn get_batch_secret_keys(batch: &Batch) -> Vec<String> {
    let mut keys = Vec::new();
    for v in batch.inputs.values() {
        collect_refs(v, &mut keys);
    }
    for v in batch.outputs.values() {
        collect_refs(v, &mut keys);
    }
    keys
}

pub fn fill_batch_secrets(batch: &mut Batch, secrets: &SecretMap) -> Result<(), String> {
    for v in batch.inputs.values_mut() {
        fill_refs(v, secrets)?;
    }
    for v in batch.outputs.values_mut() {
        fill_refs(v, secrets)?;
    }
    Ok(())
}

pub fn separate_secrets_experiment(experiment: &mut Experiment) -> SecretMap {
    let mut sep = Separator::new();
    if let Some(auth) = experiment.container.settings.image.auth.as_mut() {
        sep.walk(auth);
    }
    sep.secrets
}

pub fn get_experiment_secret_keys(experiment: &Experiment) -> Vec<String> {
    let mut keys = Vec::new();
    if let Some(auth) = experiment.container.settings.image.auth.as_ref() {
        collect_refs(auth, &mut keys);
    }
    keys
}

pub fn fill_experiment_secrets(
    experiment: &mut Experiment,
    secrets: &SecretMap,
) -> Result<(), String> {
    if let Some(auth) = experiment.container.settings.image.auth.as_mut() {
        fill_refs(auth, secrets)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BatchState;
    use serde_json::json;

    fn sample_batch() -> Batch {
        let mut batch = Batch {
            _id: bson::oid::ObjectId::new(),
            experiment_id: bson::oid::ObjectId::new(),
            username: "alice".to_string(),
            registration_time: chrono::Utc::now(),
            state: BatchState::Registered,
            node: None,
            attempts: 0,
            used_gpus: None,
            mount: false,
            inputs: Default::default(),
            outputs: Default::default(),
            history: Vec::new(),
            protected_keys_voided: false,
            notifications_sent: false,
        };
        batch.inputs.insert(
            "a".into(),
            json!({"connector": {"access": {"!secret": {"token": "t1"}}}}),
        );
        batch.inputs.insert(
            "b".into(),
            json!({"connector": {"access": {"!secret": {"token": "t1"}}}}),
        );
        batch.outputs.insert(
            "out".into(),
            json!({"connector": {"access": {"!secret": {"token": "t2"}}}}),
        );
        batch
    }

    #[test]
    fn dedups_identical_secrets() {
        let mut batch = sample_batch();
        let secrets = separate_secrets_batch(&mut batch);
        assert_eq!(secrets.len(), 2);
        let keys = get_batch_secret_keys(&batch);
        assert_eq!(keys.len(), 3);
        // the two identical secrets under "a" and "b" share a uuid.
        let a_ref = batch.inputs["a"]["connector"]["access"]["!secret_ref"]
            .as_str()
            .unwrap()
            .to_string();
        let b_ref = batch.inputs["b"]["connector"]["access"]["!secret_ref"]
            .as_str()
            .unwrap()
            .to_string();
        assert_eq!(a_ref, b_ref);
    }

    #[test]
    fn separate_then_fill_is_identity() {
        let original = sample_batch();
        let mut batch = original.clone();
        let secrets = separate_secrets_batch(&mut batch);
        fill_batch_secrets(&mut batch, &secrets).unwrap();
        assert_eq!(
            serde_json::to_value(&batch.inputs).unwrap(),
            serde_json::to_value(&original.inputs).unwrap()
        );
        assert_eq!(
            serde_json::to_value(&batch.outputs).unwrap(),
            serde_json::to_value(&original.outputs).unwrap()
        );
    }

    #[test]
    fn fill_fails_on_missing_key() {
        let mut batch = sample_batch();
        let _ = separate_secrets_batch(&mut batch);
        let err = fill_batch_secrets(&mut batch, &SecretMap::new());
        assert!(err.is_err());
    }
}
