//! Helper methods only available for tests
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use http::{Method, Request, Response, StatusCode};
use kube::client::Body;
use kube::{Client, Resource};
use serde::Serialize;
use serde_json::{json, Value};

use super::controller::Context;
use crate::addons::{AddonInstance, AddonProvisioner, AppIdentity};
use crate::controllers::{ReconcilerConfig, State};
use crate::{Error, Metrics, Result};

/// An in-memory stand-in for the Kubernetes API server.
///
/// Objects are kept as JSON keyed by their collection path (`/api/v1/namespaces/ns/pods`) and
/// name. It understands get, list with equality label selectors, create, replace, merge patch
/// (including the status subresource), and delete, and it enforces resourceVersion
/// preconditions the way the real server does.
pub struct FakeApiServer {
    client: Client,
    store: Arc<Mutex<Store>>,
}

#[derive(Default)]
struct Store {
    objects: BTreeMap<(String, String), Value>,
    resource_version: u64,
    writes: usize,
    create_conflicts: BTreeSet<String>,
}

struct Target {
    collection: String,
    resource: String,
    name: Option<String>,
    subresource: Option<String>,
}

fn parse_target(path: &str) -> Target {
    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    let ns_idx = segments
        .iter()
        .position(|s| *s == "namespaces")
        .expect("only namespaced requests are supported");
    Target {
        collection: format!("/{}", segments[..ns_idx + 3].join("/")),
        resource: segments[ns_idx + 2].to_string(),
        name: segments.get(ns_idx + 3).map(|s| s.to_string()),
        subresource: segments.get(ns_idx + 4).map(|s| s.to_string()),
    }
}

fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(fields) => {
            if !target.is_object() {
                *target = json!({});
            }
            let target = target.as_object_mut().unwrap();
            for (key, value) in fields {
                if value.is_null() {
                    target.remove(key);
                } else {
                    merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
                }
            }
        }
        other => *target = other.clone(),
    }
}

fn status_response(code: StatusCode, reason: &str, message: String) -> (StatusCode, Value) {
    (
        code,
        json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": message,
            "reason": reason,
            "code": code.as_u16(),
        }),
    )
}

fn label_selector(query: Option<&str>) -> BTreeMap<String, String> {
    let Some(query) = query else {
        return BTreeMap::new();
    };
    url::form_urlencoded::parse(query.as_bytes())
        .filter(|(k, _)| k == "labelSelector")
        .flat_map(|(_, selector)| {
            selector
                .split(',')
                .filter_map(|term| term.split_once('='))
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<Vec<_>>()
        })
        .collect()
}

fn matches_labels(object: &Value, selector: &BTreeMap<String, String>) -> bool {
    selector.iter().all(|(k, v)| {
        object["metadata"]["labels"][k.as_str()].as_str() == Some(v.as_str())
    })
}

impl Store {
    fn next_resource_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn count_write(&mut self, target: &Target) {
        if target.resource != "events" {
            self.writes += 1;
        }
    }

    fn check_resource_version(stored: &Value, requested: &Value) -> Option<(StatusCode, Value)> {
        let requested = requested["metadata"]["resourceVersion"].as_str()?;
        if stored["metadata"]["resourceVersion"].as_str() == Some(requested) {
            return None;
        }
        Some(status_response(
            StatusCode::CONFLICT,
            "Conflict",
            "the object has been modified; please apply your changes to the latest version".into(),
        ))
    }

    /// Bump the resourceVersion and, when the spec moved, the generation
    fn commit(&mut self, key: (String, String), before: Option<&Value>, mut object: Value) -> Value {
        let generation = before
            .and_then(|b| b["metadata"]["generation"].as_i64())
            .unwrap_or(0);
        let spec_changed = before.is_none_or(|b| b.get("spec") != object.get("spec"));
        object["metadata"]["generation"] = json!(if spec_changed { generation + 1 } else { generation });
        object["metadata"]["resourceVersion"] = json!(self.next_resource_version());

        let deleting = object["metadata"]["deletionTimestamp"].is_string();
        let finalized = object["metadata"]["finalizers"]
            .as_array()
            .is_none_or(|f| f.is_empty());
        if deleting && finalized {
            self.objects.remove(&key);
        } else {
            self.objects.insert(key, object.clone());
        }
        object
    }

    fn handle(&mut self, method: &Method, path: &str, query: Option<&str>, body: Value) -> (StatusCode, Value) {
        let target = parse_target(path);

        let Some(name) = target.name.clone() else {
            return match *method {
                Method::GET => self.list(&target, query),
                Method::POST => {
                    let requested = body["metadata"]["name"].as_str().unwrap_or_default().to_string();
                    if self.create_conflicts.remove(&requested) {
                        return status_response(
                            StatusCode::CONFLICT,
                            "AlreadyExists",
                            format!("{} \"{requested}\" already exists", target.resource),
                        );
                    }
                    self.create(&target, body)
                }
                _ => status_response(StatusCode::METHOD_NOT_ALLOWED, "MethodNotAllowed", path.into()),
            };
        };

        let key = (target.collection.clone(), name.clone());
        let Some(stored) = self.objects.get(&key).cloned() else {
            return status_response(
                StatusCode::NOT_FOUND,
                "NotFound",
                format!("{} \"{name}\" not found", target.resource),
            );
        };

        match *method {
            Method::GET => (StatusCode::OK, stored),
            Method::PUT => {
                if let Some(conflict) = Self::check_resource_version(&stored, &body) {
                    return conflict;
                }
                let mut object = body;
                object["metadata"]["uid"] = stored["metadata"]["uid"].clone();
                object["metadata"]["creationTimestamp"] = stored["metadata"]["creationTimestamp"].clone();
                if let Some(status) = stored.get("status") {
                    object["status"] = status.clone();
                }
                self.count_write(&target);
                (StatusCode::OK, self.commit(key, Some(&stored), object))
            }
            Method::PATCH => {
                if let Some(conflict) = Self::check_resource_version(&stored, &body) {
                    return conflict;
                }
                let mut patch = body;
                if let Some(metadata) = patch.get_mut("metadata").and_then(Value::as_object_mut) {
                    metadata.remove("resourceVersion");
                }
                let mut object = stored.clone();
                if target.subresource.as_deref() == Some("status") {
                    merge_patch(&mut object["status"], &patch["status"]);
                } else {
                    if let Some(patch) = patch.as_object_mut() {
                        patch.remove("status");
                    }
                    merge_patch(&mut object, &patch);
                }
                self.count_write(&target);
                (StatusCode::OK, self.commit(key, Some(&stored), object))
            }
            Method::DELETE => {
                self.count_write(&target);
                let has_finalizers = stored["metadata"]["finalizers"]
                    .as_array()
                    .is_some_and(|f| !f.is_empty());
                if has_finalizers {
                    let mut object = stored.clone();
                    object["metadata"]["deletionTimestamp"] = json!(now());
                    (StatusCode::OK, self.commit(key, Some(&stored), object))
                } else {
                    self.objects.remove(&key);
                    (StatusCode::OK, stored)
                }
            }
            _ => status_response(StatusCode::METHOD_NOT_ALLOWED, "MethodNotAllowed", path.into()),
        }
    }

    fn list(&self, target: &Target, query: Option<&str>) -> (StatusCode, Value) {
        let selector = label_selector(query);
        let items: Vec<Value> = self
            .objects
            .iter()
            .filter(|((collection, _), object)| {
                *collection == target.collection && matches_labels(object, &selector)
            })
            .map(|(_, object)| object.clone())
            .collect();
        (
            StatusCode::OK,
            json!({
                "apiVersion": "v1",
                "kind": "List",
                "metadata": {"resourceVersion": self.resource_version.to_string()},
                "items": items,
            }),
        )
    }

    fn create(&mut self, target: &Target, mut object: Value) -> (StatusCode, Value) {
        let Some(name) = object["metadata"]["name"].as_str().map(str::to_string) else {
            return status_response(StatusCode::UNPROCESSABLE_ENTITY, "Invalid", "name is required".into());
        };
        let key = (target.collection.clone(), name.clone());
        if self.objects.contains_key(&key) {
            return status_response(
                StatusCode::CONFLICT,
                "AlreadyExists",
                format!("{} \"{name}\" already exists", target.resource),
            );
        }
        if object["metadata"]["uid"].is_null() {
            object["metadata"]["uid"] = json!(format!("{}-{name}-uid", target.resource));
        }
        object["metadata"]["creationTimestamp"] = json!(now());
        self.count_write(target);
        (StatusCode::CREATED, self.commit(key, None, object))
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn collection_of<K: Resource<DynamicType = ()>>(namespace: &str) -> String {
    K::url_path(&(), Some(namespace))
}

impl FakeApiServer {
    /// Start serving requests; must be called from within a tokio runtime
    pub fn start() -> Self {
        let (mock_service, mut handle) =
            tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let store = Arc::new(Mutex::new(Store::default()));

        let server_store = store.clone();
        tokio::spawn(async move {
            while let Some((request, send)) = handle.next_request().await {
                let method = request.method().clone();
                let path = request.uri().path().to_string();
                let query = request.uri().query().map(str::to_string);
                let bytes = request.into_body().collect_bytes().await.unwrap();
                let body: Value = if bytes.is_empty() {
                    Value::Null
                } else {
                    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
                };

                let (status, payload) =
                    server_store
                        .lock()
                        .unwrap()
                        .handle(&method, &path, query.as_deref(), body);

                send.send_response(
                    Response::builder()
                        .status(status)
                        .header("content-type", "application/json")
                        .body(Body::from(serde_json::to_vec(&payload).unwrap()))
                        .unwrap(),
                );
            }
        });

        Self {
            client: Client::new(mock_service, "default"),
            store,
        }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Mutating calls made against the server, events excluded
    pub fn writes(&self) -> usize {
        self.store.lock().unwrap().writes
    }

    pub fn reset_writes(&self) {
        self.store.lock().unwrap().writes = 0;
    }

    /// Seed an object as if someone else created it; not counted as a write
    pub fn insert<K: Resource<DynamicType = ()> + Serialize>(&self, object: &K) {
        let namespace = object.meta().namespace.clone().unwrap_or_else(|| "default".into());
        let target = parse_target(&collection_of::<K>(&namespace));
        let mut store = self.store.lock().unwrap();
        let writes = store.writes;
        store.create(&target, serde_json::to_value(object).unwrap());
        store.writes = writes;
    }

    /// Answer the next create of `name` with AlreadyExists, as if another writer
    /// got there between our read and our write
    pub fn conflict_on_next_create(&self, name: &str) {
        self.store.lock().unwrap().create_conflicts.insert(name.into());
    }

    /// Edit a stored object in place, e.g. to move a pod to another phase
    pub fn modify<K: Resource<DynamicType = ()>>(
        &self,
        namespace: &str,
        name: &str,
        f: impl FnOnce(&mut Value),
    ) {
        let key = (collection_of::<K>(namespace), name.to_string());
        let mut store = self.store.lock().unwrap();
        let before = store.objects.get(&key).cloned().expect("object to modify");
        let mut object = before.clone();
        f(&mut object);
        store.commit(key, Some(&before), object);
    }

    pub fn names<K: Resource<DynamicType = ()>>(&self, namespace: &str) -> Vec<String> {
        let collection = collection_of::<K>(namespace);
        self.store
            .lock()
            .unwrap()
            .objects
            .keys()
            .filter(|(c, _)| *c == collection)
            .map(|(_, name)| name.clone())
            .collect()
    }
}

/// Add-on provisioning that succeeds unless told otherwise
#[derive(Default)]
pub struct StubAddons {
    pub failing: BTreeSet<String>,
    pub credentials: BTreeMap<String, BTreeMap<String, String>>,
    pub credentials_unavailable: BTreeSet<String>,
}

#[async_trait]
impl AddonProvisioner for StubAddons {
    async fn provision(&self, _identity: &AppIdentity, addon: &str) -> Result<AddonInstance> {
        if self.failing.contains(addon) {
            return Err(Error::AddonProvisionFailed(format!("{addon} is out of capacity")));
        }
        Ok(AddonInstance {
            specs: BTreeMap::from([("version".to_string(), "8.0".to_string())]),
        })
    }

    async fn credentials(
        &self,
        _identity: &AppIdentity,
        addon: &str,
    ) -> Result<BTreeMap<String, String>> {
        if self.credentials_unavailable.contains(addon) {
            return Err(Error::AddonProvisionFailed(format!("{addon} credentials unavailable")));
        }
        Ok(self.credentials.get(addon).cloned().unwrap_or_default())
    }
}

pub fn test_context(server: &FakeApiServer, addons: StubAddons) -> Arc<Context> {
    test_context_with_config(server, addons, ReconcilerConfig::default())
}

pub fn test_context_with_config(
    server: &FakeApiServer,
    addons: StubAddons,
    config: ReconcilerConfig,
) -> Arc<Context> {
    let state = State::new(config);
    Context::new(server.client(), Metrics::default(), state, Arc::new(addons))
}
