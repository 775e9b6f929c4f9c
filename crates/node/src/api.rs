//! JSON HTTP API, served on the peer port through the endpoint's sniffing.
//!
//! | Route | Description |
//! |-------|-------------|
//! | `GET /kv/{key}` | Read; optional `{"context": {...}}` body |
//! | `PUT /kv/{key}` | Write `{"value": "...", "context": {...}}` |
//! | `DELETE /kv/{key}` | Tombstone; optional context body |
//! | `GET /view` | Membership view |
//! | `PUT /view/{peer}`, `DELETE /view/{peer}` | Change membership |
//! | `GET /shards` | Shard layout and ring positions |
//! | `PUT /shards/{count}` | Re-partition into `count` shards |
//! | `GET /health` | Liveness |
//! | `GET /metrics` | Prometheus text exposition |

use crate::service::{Forwarder, KvError, KvService};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shardkv_cluster::{MembershipView, ShardTopology};
use shardkv_common::VClock;
use shardkv_net::HttpHandler;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Default, Deserialize)]
struct KvBody {
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    context: VClock,
}

#[derive(Debug, Serialize)]
struct ShardsView {
    my_shard: Option<u32>,
    shards: BTreeMap<String, Vec<String>>,
    ring: Vec<(u64, u32)>,
}

type HttpResponse = Response<Full<Bytes>>;

fn with_type(status: StatusCode, body: Bytes, content_type: &'static str) -> HttpResponse {
    let mut resp = Response::new(Full::new(body));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}

fn json_response(status: StatusCode, body: serde_json::Value) -> HttpResponse {
    with_type(status, Bytes::from(body.to_string()), "application/json")
}

fn error_response(status: StatusCode, message: impl std::fmt::Display) -> HttpResponse {
    json_response(status, json!({ "error": message.to_string() }))
}

fn kv_error(e: KvError) -> HttpResponse {
    tracing::warn!(error = %e, "kv request failed");
    match e {
        KvError::Storage(_) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
        KvError::NoPeer(_) | KvError::Forward { .. } => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, e)
        }
    }
}

pub struct NodeApi<F: Forwarder> {
    service: Arc<KvService<F>>,
    topology: Arc<ShardTopology>,
    membership: Arc<MembershipView>,
}

impl<F: Forwarder> NodeApi<F> {
    pub fn new(
        service: Arc<KvService<F>>,
        topology: Arc<ShardTopology>,
        membership: Arc<MembershipView>,
    ) -> Self {
        Self {
            service,
            topology,
            membership,
        }
    }

    async fn read_body(req: Request<Incoming>) -> Result<KvBody, HttpResponse> {
        let bytes = req
            .into_body()
            .collect()
            .await
            .map_err(|e| error_response(StatusCode::BAD_REQUEST, e))?
            .to_bytes();
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(KvBody::default());
        }
        serde_json::from_slice(&bytes).map_err(|e| error_response(StatusCode::BAD_REQUEST, e))
    }

    async fn kv(&self, method: Method, key: String, req: Request<Incoming>) -> HttpResponse {
        if key.is_empty() {
            return error_response(StatusCode::BAD_REQUEST, "missing key");
        }
        let body = match Self::read_body(req).await {
            Ok(b) => b,
            Err(resp) => return resp,
        };

        match method {
            Method::GET => match self.service.get(&key, body.context).await {
                Ok(got) => {
                    let status = if got.value.is_some() {
                        StatusCode::OK
                    } else {
                        StatusCode::NOT_FOUND
                    };
                    let value = got.value.map(|v| String::from_utf8_lossy(&v).into_owned());
                    json_response(
                        status,
                        json!({ "key": key, "value": value, "context": got.clock }),
                    )
                }
                Err(e) => kv_error(e),
            },
            Method::PUT => {
                let Some(value) = body.value else {
                    return error_response(StatusCode::BAD_REQUEST, "missing value");
                };
                match self.service.put(&key, value.into_bytes(), body.context).await {
                    Ok(put) if !put.applied => json_response(
                        StatusCode::BAD_REQUEST,
                        json!({ "error": "key or value too large", "context": put.clock }),
                    ),
                    Ok(put) => {
                        let status = if put.replaced {
                            StatusCode::OK
                        } else {
                            StatusCode::CREATED
                        };
                        json_response(
                            status,
                            json!({ "replaced": put.replaced, "context": put.clock }),
                        )
                    }
                    Err(e) => kv_error(e),
                }
            }
            Method::DELETE => match self.service.delete(&key, body.context).await {
                Ok(del) => {
                    let status = if del.applied {
                        StatusCode::OK
                    } else {
                        StatusCode::NOT_FOUND
                    };
                    json_response(status, json!({ "deleted": del.applied, "context": del.clock }))
                }
                Err(e) => kv_error(e),
            },
            _ => error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
        }
    }

    fn view(&self, method: &Method, peer: Option<&str>) -> HttpResponse {
        match (method, peer) {
            (&Method::GET, None) => {
                json_response(StatusCode::OK, json!({ "view": self.membership.list() }))
            }
            (&Method::PUT, Some(peer)) if !peer.is_empty() => {
                let added = self.membership.add(peer);
                self.topology.add_peer(peer);
                let status = if added {
                    StatusCode::CREATED
                } else {
                    StatusCode::OK
                };
                json_response(status, json!({ "added": added, "view": self.membership.list() }))
            }
            (&Method::DELETE, Some(peer)) if !peer.is_empty() => {
                let removed = self.membership.remove(peer);
                self.topology.remove_peer(peer);
                let status = if removed {
                    StatusCode::OK
                } else {
                    StatusCode::NOT_FOUND
                };
                json_response(status, json!({ "removed": removed, "view": self.membership.list() }))
            }
            _ => error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
        }
    }

    fn shards_view(&self) -> ShardsView {
        let snapshot = self.topology.snapshot();
        ShardsView {
            my_shard: self.topology.my_shard().map(|s| s.0),
            shards: snapshot
                .shards
                .into_iter()
                .map(|(id, members)| (id.to_string(), members))
                .collect(),
            ring: self
                .topology
                .ring_positions()
                .into_iter()
                .map(|(pos, id)| (pos, id.0))
                .collect(),
        }
    }

    fn shards(&self, method: &Method, count: Option<&str>) -> HttpResponse {
        match (method, count) {
            (&Method::GET, None) => match serde_json::to_value(self.shards_view()) {
                Ok(v) => json_response(StatusCode::OK, v),
                Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
            },
            (&Method::PUT, Some(count)) => {
                let Ok(count) = count.parse::<usize>() else {
                    return error_response(StatusCode::BAD_REQUEST, "shard count must be a number");
                };
                if self.topology.reshard(count) {
                    json_response(StatusCode::OK, json!({ "shards": count }))
                } else {
                    error_response(
                        StatusCode::BAD_REQUEST,
                        format!("not enough peers for {count} shards"),
                    )
                }
            }
            _ => error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
        }
    }
}

/// Split `/prefix/rest` into `("prefix", Some("rest"))`.
fn split_path(path: &str) -> (&str, Option<&str>) {
    let trimmed = path.trim_start_matches('/');
    match trimmed.split_once('/') {
        Some((head, rest)) => (head, Some(rest)),
        None => (trimmed, None),
    }
}

#[async_trait::async_trait]
impl<F: Forwarder> HttpHandler for NodeApi<F> {
    async fn handle(&self, req: Request<Incoming>) -> HttpResponse {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        tracing::debug!(%method, path = %path, "http request");

        match split_path(&path) {
            ("kv", Some(key)) => {
                let key = key.to_string();
                self.kv(method, key, req).await
            }
            ("view", peer) => self.view(&method, peer),
            ("shards", count) => self.shards(&method, count),
            ("health", None) => json_response(
                StatusCode::OK,
                json!({ "status": "ok", "node": self.service.local() }),
            ),
            ("metrics", None) => with_type(
                StatusCode::OK,
                Bytes::from(shardkv_metrics::encode_metrics()),
                "text/plain; version=0.0.4; charset=utf-8",
            ),
            _ => error_response(StatusCode::NOT_FOUND, "no such route"),
        }
    }
}
