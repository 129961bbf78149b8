//! A `kube::Client` wired to a wiremock server standing in for the API server

use kube::{Client, Config};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use wiremock::{MockServer, ResponseTemplate};

pub const NAMESPACE: &str = "agents";

/// Client whose requests all go to `server`. Must be called inside a runtime.
pub fn mock_client(server: &MockServer) -> Client {
    let mut config = Config::new(server.uri().parse().unwrap());
    config.default_namespace = NAMESPACE.to_string();
    Client::try_from(config).unwrap()
}

/// `metav1.Status` failure body the API server returns for errors
pub fn status_error(code: u16, reason: &str, message: &str) -> ResponseTemplate {
    ResponseTemplate::new(code).set_body_json(json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": message,
        "reason": reason,
        "code": code
    }))
}

pub fn not_found(resource: &str, name: &str) -> ResponseTemplate {
    status_error(404, "NotFound", &format!("{resource} \"{name}\" not found"))
}

/// List response of `kind` (e.g. `DeploymentList`) holding `items`
pub fn list<T: Serialize>(api_version: &str, kind: &str, items: &[T]) -> ResponseTemplate {
    let items: Vec<Value> = items
        .iter()
        .map(|item| serde_json::to_value(item).unwrap())
        .collect();
    ResponseTemplate::new(200).set_body_json(json!({
        "apiVersion": api_version,
        "kind": kind,
        "metadata": {},
        "items": items
    }))
}

/// Bodies of every request with `method` the server received, decoded as `K`
pub async fn received<K: DeserializeOwned>(server: &MockServer, method: &str) -> Vec<K> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|request| request.method.as_str() == method)
        .map(|request| serde_json::from_slice(&request.body).unwrap())
        .collect()
}
