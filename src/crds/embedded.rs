//! Decoding of the Kubernetes objects embedded in a Function spec.
//!
//! Functions written for older clusters carry `extensions/v1beta1` deployments
//! or `autoscaling/v2beta1` autoscalers. The typed k8s-openapi objects only
//! accept their own `apiVersion`, so the type meta is dropped before decoding
//! and legacy autoscaler metrics are rewritten into the `autoscaling/v2` shape.

use serde::{de::DeserializeOwned, Deserialize, Deserializer};
use serde_json::{json, Map, Value};

const LEGACY_AUTOSCALING_API_VERSION: &str = "autoscaling/v2beta1";

/// Decodes an embedded object whatever `apiVersion` and `kind` it declares.
/// `null` decodes to the default object.
pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let mut value = Value::deserialize(deserializer)?;
    strip_type_meta(&mut value);

    decode(value)
}

/// Like [`deserialize`], upgrading `autoscaling/v2beta1` metrics first.
pub fn deserialize_autoscaler<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let mut value = Value::deserialize(deserializer)?;

    if strip_type_meta(&mut value).as_deref() == Some(LEGACY_AUTOSCALING_API_VERSION) {
        upgrade_legacy_metrics(&mut value);
    }

    decode(value)
}

fn decode<T, E>(value: Value) -> Result<T, E>
where
    T: DeserializeOwned + Default,
    E: serde::de::Error,
{
    if value.is_null() {
        return Ok(T::default());
    }

    serde_json::from_value(value).map_err(E::custom)
}

/// Removes `apiVersion` and `kind`, returning the declared `apiVersion`.
fn strip_type_meta(value: &mut Value) -> Option<String> {
    let object = value.as_object_mut()?;
    object.remove("kind");

    match object.remove("apiVersion") {
        Some(Value::String(api_version)) => Some(api_version),
        _ => None,
    }
}

fn upgrade_legacy_metrics(autoscaler: &mut Value) {
    let Some(metrics) = autoscaler
        .pointer_mut("/spec/metrics")
        .and_then(Value::as_array_mut)
    else {
        return;
    };

    for metric in metrics {
        upgrade_legacy_metric(metric);
    }
}

fn upgrade_legacy_metric(metric: &mut Value) {
    let (field, selector_key, is_object) = match metric.get("type").and_then(Value::as_str) {
        Some("Resource") => ("resource", None, false),
        Some("ContainerResource") => ("containerResource", None, false),
        Some("Pods") => ("pods", Some("selector"), false),
        Some("Object") => ("object", Some("selector"), true),
        Some("External") => ("external", Some("metricSelector"), false),
        _ => return,
    };

    let Some(source) = metric.get_mut(field).and_then(Value::as_object_mut) else {
        return;
    };

    // v2beta1 names the described object `target`
    if is_object {
        if let Some(described) = source.remove("target") {
            source.insert(String::from("describedObject"), described);
        }
    }

    if let Some(selector_key) = selector_key {
        let mut identifier = Map::new();
        if let Some(name) = source.remove("metricName") {
            identifier.insert(String::from("name"), name);
        }
        if let Some(selector) = source.remove(selector_key) {
            identifier.insert(String::from("selector"), selector);
        }
        source.insert(String::from("metric"), Value::Object(identifier));
    }

    let target = legacy_target(source);
    source.insert(String::from("target"), target);
}

fn legacy_target(source: &mut Map<String, Value>) -> Value {
    if let Some(utilization) = source.remove("targetAverageUtilization") {
        return json!({ "type": "Utilization", "averageUtilization": utilization });
    }

    let average = source
        .remove("targetAverageValue")
        .or_else(|| source.remove("averageValue"));
    let value = source.remove("targetValue");

    match (average, value) {
        (Some(average), _) => json!({ "type": "AverageValue", "averageValue": average }),
        (None, Some(value)) => json!({ "type": "Value", "value": value }),
        (None, None) => json!({ "type": "Utilization" }),
    }
}
