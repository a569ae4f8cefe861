//! OpenStack-style JSON over HTTP.
//!
//! Sessions authenticate with Keystone v3 password auth; the token comes
//! back in `X-Subject-Token` and the service catalog in the body. Endpoints
//! from the config override catalog entries.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder};
use serde_json::{json, Value};
use tracing::debug;

use crate::api::{Cloud, Connector, ResourceApi};
use crate::config::Config;
use crate::error::{Result, SpamError};
use crate::types::{Attrs, Collection, Credential, RemoteObject, ResourceKind};

const TOKEN_HEADER: &str = "X-Subject-Token";
const AUTH_HEADER: &str = "X-Auth-Token";
const IMAGE_PATCH: &str = "application/openstack-images-v2.1-json-patch";

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

pub struct RestConnector {
    endpoints: BTreeMap<Collection, String>,
    timeout: Duration,
}

impl RestConnector {
    pub fn new(config: &Config) -> Self {
        Self {
            endpoints: config.endpoints.clone(),
            timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }
}

impl Connector for RestConnector {
    fn connect(&self, credential: &Credential) -> Result<Arc<dyn Cloud>> {
        let fail = |e: &dyn std::fmt::Display| {
            SpamError::remote("authenticate", ResourceKind::User.as_str(), e)
        };
        let client = Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| fail(&e))?;
        let auth_url = credential.auth_url.trim_end_matches('/');
        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": credential.username,
                            "password": credential.password,
                            "domain": { "id": credential.user_domain_id },
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": credential.project_name,
                        "domain": { "id": credential.project_domain_id },
                    }
                }
            }
        });
        let resp = client
            .post(format!("{auth_url}/auth/tokens"))
            .json(&body)
            .send()
            .map_err(|e| fail(&e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(fail(&format!("{status} for {}", credential.username)));
        }
        let token = resp
            .headers()
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| fail(&"response carries no token"))?;
        let catalog: Value = resp.json().unwrap_or(Value::Null);

        let mut endpoints = parse_catalog(&catalog);
        endpoints.insert(Collection::Identity, auth_url.to_string());
        for (collection, url) in &self.endpoints {
            endpoints.insert(*collection, url.trim_end_matches('/').to_string());
        }
        debug!(principal = %credential.username, endpoints = endpoints.len(), "session opened");

        Ok(Arc::new(RestSession {
            http: Http { client, token },
            endpoints,
            principal: credential.username.clone(),
        }))
    }
}

/// Public endpoints by collection from a Keystone v3 token body.
fn parse_catalog(body: &Value) -> BTreeMap<Collection, String> {
    let mut out = BTreeMap::new();
    let Some(services) = body.pointer("/token/catalog").and_then(Value::as_array) else {
        return out;
    };
    for service in services {
        let collection = match service.get("type").and_then(Value::as_str) {
            Some("identity") => Collection::Identity,
            Some("network") => Collection::Network,
            Some("volumev3" | "volumev2" | "volume" | "block-storage") => Collection::Storage,
            Some("compute") => Collection::Compute,
            Some("image") => Collection::Image,
            Some("object-store") => Collection::Object,
            _ => continue,
        };
        let url = service
            .get("endpoints")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .find(|e| e.get("interface").and_then(Value::as_str) == Some("public"))
            .and_then(|e| e.get("url"))
            .and_then(Value::as_str);
        if let Some(url) = url {
            out.entry(collection)
                .or_insert_with(|| url.trim_end_matches('/').to_string());
        }
    }
    out
}

// ---------------------------------------------------------------------------
// HTTP plumbing
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Http {
    client: Client,
    token: String,
}

impl Http {
    fn send(&self, req: RequestBuilder, operation: &str, kind: ResourceKind) -> Result<Option<Value>> {
        let fail = |e: &dyn std::fmt::Display| SpamError::remote(operation, kind.as_str(), e);
        let resp = req
            .header(AUTH_HEADER, &self.token)
            .send()
            .map_err(|e| fail(&e))?;
        let status = resp.status();
        let body = resp.text().map_err(|e| fail(&e))?;
        if !status.is_success() {
            return Err(fail(&format!("{status}: {}", body.trim())));
        }
        if body.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&body).map(Some).map_err(|e| fail(&e))
    }
}

/// Append the API version segment a collection's base URL may lack.
fn versioned(collection: Collection, base: &str) -> String {
    let suffix = match collection {
        Collection::Network => "/v2.0",
        Collection::Image => "/v2",
        _ => "",
    };
    if suffix.is_empty() || base.ends_with(suffix) {
        base.to_string()
    } else {
        format!("{base}{suffix}")
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct RestSession {
    http: Http,
    endpoints: BTreeMap<Collection, String>,
    principal: String,
}

impl RestSession {
    fn base(&self, collection: Collection) -> Result<String> {
        self.endpoints
            .get(&collection)
            .map(|url| versioned(collection, url))
            .ok_or_else(|| SpamError::MissingSetting(format!("endpoint for {collection}")))
    }
}

impl Cloud for RestSession {
    fn principal(&self) -> &str {
        &self.principal
    }

    fn resource(&self, kind: ResourceKind) -> Result<Arc<dyn ResourceApi>> {
        let root = self.base(kind.collection())?;
        let path = match kind {
            ResourceKind::Container => root.clone(),
            _ => format!("{root}/{}", kind.as_str()),
        };
        Ok(Arc::new(RestApi {
            http: self.http.clone(),
            kind,
            root,
            path,
        }))
    }

    fn update_quotas(&self, collection: Collection, project_id: &str, quotas: &Attrs) -> Result<()> {
        let base = self.base(collection)?;
        let (url, body) = match collection {
            Collection::Network => (
                format!("{base}/quotas/{project_id}"),
                json!({ "quota": quotas }),
            ),
            Collection::Storage | Collection::Compute => (
                format!("{base}/os-quota-sets/{project_id}"),
                json!({ "quota_set": quotas }),
            ),
            _ => {
                return Err(SpamError::Unsupported {
                    operation: "update_quotas".into(),
                    kind: collection.to_string(),
                })
            }
        };
        self.http.send(
            self.http.client.put(url).json(&body),
            "update_quotas",
            ResourceKind::Project,
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-kind API
// ---------------------------------------------------------------------------

struct RestApi {
    http: Http,
    kind: ResourceKind,
    root: String,
    path: String,
}

impl RestApi {
    fn send(&self, req: RequestBuilder, operation: &str) -> Result<Option<Value>> {
        self.http.send(req, operation, self.kind)
    }

    fn client(&self) -> &Client {
        &self.http.client
    }

    /// Unwrap `{"<singular>": {...}}`, or take a bare object as is.
    fn one(&self, operation: &str, body: Option<Value>) -> Result<RemoteObject> {
        let mut body = body
            .ok_or_else(|| SpamError::remote(operation, self.kind.as_str(), "empty response"))?;
        let value = match body.get_mut(self.kind.singular()).map(Value::take) {
            Some(inner) => inner,
            None => body,
        };
        serde_json::from_value(value)
            .map_err(|e| SpamError::remote(operation, self.kind.as_str(), e))
    }

    /// Unwrap `{"<plural>": [...]}` or a bare array.
    fn many(&self, operation: &str, body: Option<Value>) -> Result<Vec<RemoteObject>> {
        let items = match body {
            None => return Ok(Vec::new()),
            Some(Value::Array(items)) => items,
            Some(mut body) => match body.get_mut(self.kind.as_str()).map(Value::take) {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            },
        };
        items
            .into_iter()
            .map(|mut item| {
                if self.kind == ResourceKind::Container {
                    if let Some(name) = item.get("name").cloned() {
                        item["id"] = name;
                    }
                }
                serde_json::from_value(item)
                    .map_err(|e| SpamError::remote(operation, self.kind.as_str(), e))
            })
            .collect()
    }

    fn envelope(&self, attrs: &Attrs) -> Value {
        match self.kind {
            ResourceKind::Image => Value::Object(attrs.clone()),
            _ => json!({ self.kind.singular(): attrs }),
        }
    }

    fn volume_action(&self, id: &str, operation: &str, body: Value) -> Result<RemoteObject> {
        self.send(
            self.client()
                .post(format!("{}/{id}/action", self.path))
                .json(&body),
            operation,
        )?;
        Ok(RemoteObject::new(id, None))
    }

    fn grant_role(&self, id: &str, attrs: &Attrs) -> Result<RemoteObject> {
        let project = attrs.get("project_id").and_then(Value::as_str).unwrap_or_default();
        let role = attrs.get("role").and_then(Value::as_str).unwrap_or("member");
        let roles = self.send(
            self.client()
                .get(format!("{}/roles", self.root))
                .query(&[("name", role)]),
            "grant_role",
        )?;
        let role_id = roles
            .as_ref()
            .and_then(|b| b.pointer("/roles/0/id"))
            .and_then(Value::as_str)
            .ok_or_else(|| SpamError::remote("grant_role", "roles", format!("no role '{role}'")))?;
        self.send(
            self.client().put(format!(
                "{}/projects/{project}/users/{id}/roles/{role_id}",
                self.root
            )),
            "grant_role",
        )?;
        Ok(RemoteObject::new(id, None))
    }
}

impl ResourceApi for RestApi {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    fn create(&self, attrs: &Attrs) -> Result<RemoteObject> {
        if self.kind == ResourceKind::Container {
            let name = attrs.get("name").and_then(Value::as_str).unwrap_or_default();
            self.send(self.client().put(format!("{}/{name}", self.path)), "create")?;
            return Ok(RemoteObject::new(name, Some(name.to_string())));
        }
        let body = self.send(self.client().post(self.path.as_str()).json(&self.envelope(attrs)), "create")?;
        self.one("create", body)
    }

    fn update(&self, id: &str, attrs: &Attrs) -> Result<RemoteObject> {
        let url = format!("{}/{id}", self.path);
        let req = match self.kind.collection() {
            Collection::Identity => self.client().patch(url).json(&self.envelope(attrs)),
            Collection::Image => {
                let ops: Vec<Value> = attrs
                    .iter()
                    .map(|(k, v)| json!({ "op": "replace", "path": format!("/{k}"), "value": v }))
                    .collect();
                self.client()
                    .patch(url)
                    .header(reqwest::header::CONTENT_TYPE, IMAGE_PATCH)
                    .body(Value::Array(ops).to_string())
            }
            Collection::Object => {
                return Err(SpamError::Unsupported {
                    operation: "update".into(),
                    kind: self.kind.to_string(),
                })
            }
            _ => self.client().put(url).json(&self.envelope(attrs)),
        };
        let body = self.send(req, "update")?;
        self.one("update", body)
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.send(self.client().delete(format!("{}/{id}", self.path)), "delete")?;
        Ok(())
    }

    fn get(&self, id: &str) -> Result<RemoteObject> {
        let url = format!("{}/{id}", self.path);
        if self.kind == ResourceKind::Container {
            self.send(self.client().head(url), "get")?;
            return Ok(RemoteObject::new(id, Some(id.to_string())));
        }
        let body = self.send(self.client().get(url), "get")?;
        self.one("get", body)
    }

    fn find(&self, name: &str) -> Result<RemoteObject> {
        if self.kind == ResourceKind::Container {
            return self.get(name);
        }
        let body = self.send(self.client().get(self.path.as_str()).query(&[("name", name)]), "find")?;
        self.many("find", body)?
            .into_iter()
            .find(|o| o.name() == name)
            .ok_or_else(|| {
                SpamError::remote(
                    "find",
                    self.kind.as_str(),
                    format!("404 Not Found: {} named '{name}'", self.kind.singular()),
                )
            })
    }

    fn list(&self) -> Result<Vec<RemoteObject>> {
        let req = match self.kind {
            ResourceKind::Container => self.client().get(self.path.as_str()).query(&[("format", "json")]),
            _ => self.client().get(self.path.as_str()),
        };
        let body = self.send(req, "list")?;
        self.many("list", body)
    }

    fn perform(&self, id: &str, operation: &str, attrs: &Attrs) -> Result<RemoteObject> {
        match (self.kind, operation) {
            (ResourceKind::User, "grant_role") => self.grant_role(id, attrs),
            (ResourceKind::Volume, "attach") => self.volume_action(
                id,
                operation,
                json!({ "os-attach": {
                    "instance_uuid": attrs.get("server_id"),
                    "mountpoint": "/dev/vdb",
                }}),
            ),
            (ResourceKind::Volume, "detach") => {
                self.volume_action(id, operation, json!({ "os-detach": {} }))
            }
            (ResourceKind::Volume, "extend") => self.volume_action(
                id,
                operation,
                json!({ "os-extend": { "new_size": attrs.get("new_size") } }),
            ),
            (ResourceKind::Image, "upload") => {
                self.send(
                    self.client()
                        .put(format!("{}/{id}/file", self.path))
                        .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                        .body(Vec::<u8>::new()),
                    operation,
                )?;
                Ok(RemoteObject::new(id, None))
            }
            _ => Err(SpamError::Unsupported {
                operation: operation.to_string(),
                kind: self.kind.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mockito::Matcher;

    fn credential(server: &mockito::Server) -> Credential {
        Credential {
            username: "admin".into(),
            password: "secret".into(),
            project_name: "admin".into(),
            user_domain_id: "default".into(),
            project_domain_id: "default".into(),
            auth_url: format!("{}/v3", server.url()),
            created_at: Utc::now(),
        }
    }

    fn login(server: &mut mockito::Server, catalog: Value) -> mockito::Mock {
        server
            .mock("POST", "/v3/auth/tokens")
            .with_status(201)
            .with_header(TOKEN_HEADER, "tok-1")
            .with_body(json!({ "token": { "catalog": catalog } }).to_string())
            .create()
    }

    #[test]
    fn connect_then_create_uses_token_and_envelope() {
        let mut server = mockito::Server::new();
        let auth = login(&mut server, json!([]));
        let create = server
            .mock("POST", "/v3/users")
            .match_header(AUTH_HEADER, "tok-1")
            .match_body(Matcher::PartialJson(json!({ "user": { "name": "alice" } })))
            .with_status(201)
            .with_body(r#"{"user": {"id": "u1", "name": "alice", "enabled": true}}"#)
            .create();

        let connector = RestConnector::new(&Config::default());
        let cloud = connector.connect(&credential(&server)).unwrap();
        let users = cloud.resource(ResourceKind::User).unwrap();
        let mut attrs = Attrs::new();
        attrs.insert("name".into(), json!("alice"));
        let user = users.create(&attrs).unwrap();

        assert_eq!(user.id, "u1");
        assert_eq!(user.attr("enabled"), Some(&json!(true)));
        auth.assert();
        create.assert();
    }

    #[test]
    fn rejected_login_is_a_remote_error() {
        let mut server = mockito::Server::new();
        let _auth = server
            .mock("POST", "/v3/auth/tokens")
            .with_status(401)
            .create();
        let err = RestConnector::new(&Config::default())
            .connect(&credential(&server))
            .err()
            .unwrap();
        assert!(err.is_recoverable());
    }

    #[test]
    fn find_queries_by_name() {
        let mut server = mockito::Server::new();
        let _auth = login(&mut server, json!([]));
        let _find = server
            .mock("GET", "/v3/projects")
            .match_query(Matcher::UrlEncoded("name".into(), "admin".into()))
            .with_body(r#"{"projects": [{"id": "p1", "name": "admin"}]}"#)
            .create();

        let cloud = RestConnector::new(&Config::default())
            .connect(&credential(&server))
            .unwrap();
        let project = cloud
            .resource(ResourceKind::Project)
            .unwrap()
            .find("admin")
            .unwrap();
        assert_eq!(project.id, "p1");
    }

    #[test]
    fn catalog_supplies_versioned_endpoints() {
        let mut server = mockito::Server::new();
        let network_url = format!("{}/network", server.url());
        let _auth = login(
            &mut server,
            json!([{
                "type": "network",
                "endpoints": [
                    { "interface": "internal", "url": "http://internal:9696" },
                    { "interface": "public", "url": network_url },
                ]
            }]),
        );
        let _list = server
            .mock("GET", "/network/v2.0/networks")
            .with_body(r#"{"networks": [{"id": "n1", "name": "net"}]}"#)
            .create();

        let cloud = RestConnector::new(&Config::default())
            .connect(&credential(&server))
            .unwrap();
        let nets = cloud.resource(ResourceKind::Network).unwrap().list().unwrap();
        assert_eq!(nets.len(), 1);
        assert_eq!(nets[0].name(), "net");
        assert!(cloud.resource(ResourceKind::Volume).is_err());
    }

    #[test]
    fn failed_delete_reports_status() {
        let mut server = mockito::Server::new();
        let _auth = login(&mut server, json!([]));
        let _delete = server
            .mock("DELETE", "/v3/users/u9")
            .with_status(404)
            .with_body("could not find user")
            .create();

        let cloud = RestConnector::new(&Config::default())
            .connect(&credential(&server))
            .unwrap();
        let err = cloud
            .resource(ResourceKind::User)
            .unwrap()
            .delete("u9")
            .unwrap_err();
        assert!(err.to_string().contains("404"));
    }
}
