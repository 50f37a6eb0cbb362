// src/platform/xapi.rs

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use hyper::{Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, Uri as UnixUri};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    ControlError, ControlPlane, NetworkRecord, ObjectEvent, ObjectRef, OtherConfig, VifRecord, VifSpec,
    VmMetricsRecord, VmRecord,
};

/// Failure code returned once a session has expired
const SESSION_INVALID: &str = "SESSION_INVALID";

/// JSON-RPC client for the toolstack API on its local Unix socket.
///
/// A session is logged in lazily and transparently re-established once if
/// the toolstack reports it invalid. Event subscriptions are replayed on the
/// new session.
pub struct XapiClient {
    /// Path of the toolstack's local socket
    socket_path: PathBuf,

    /// HTTP client bound to the Unix socket
    client: Client<hyperlocal::UnixConnector>,

    /// Login username
    username: String,

    /// Login password
    password: String,

    /// Timeout for ordinary calls
    request_timeout: Duration,

    /// Timeout for a blocking `event.next`
    event_timeout: Duration,

    /// Current session reference
    session: Mutex<Option<String>>,

    /// Classes registered for events, replayed after re-login
    registered: Mutex<Vec<String>>,

    /// JSON-RPC request id counter
    next_id: AtomicU64,
}

impl XapiClient {
    /// Creates a client for the socket at `socket_path`
    pub fn new(
        socket_path: impl Into<PathBuf>,
        username: impl Into<String>,
        password: impl Into<String>,
        request_timeout: Duration,
        event_timeout: Duration,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            client: Client::unix(),
            username: username.into(),
            password: password.into(),
            request_timeout,
            event_timeout,
            session: Mutex::new(None),
            registered: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Sends one JSON-RPC request and returns its `result`
    async fn rpc(&self, method: &str, params: Vec<Value>, timeout: Duration) -> Result<Value, ControlError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });

        let req = Request::builder()
            .method(Method::POST)
            .uri::<hyper::Uri>(UnixUri::new(&self.socket_path, "/jsonrpc").into())
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .map_err(|e| ControlError::Transport(e.to_string()))?;

        let resp = tokio::time::timeout(timeout, self.client.request(req))
            .await
            .map_err(|_| ControlError::Timeout(format!("{} after {:?}", method, timeout)))?
            .map_err(|e| ControlError::Transport(format!("{}: {}", method, e)))?;

        let status = resp.status();
        let bytes = hyper::body::to_bytes(resp.into_body())
            .await
            .map_err(|e| ControlError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(ControlError::Transport(format!(
                "{} returned HTTP {}: {}",
                method,
                status,
                String::from_utf8_lossy(&bytes)
            )));
        }

        let mut reply: Value =
            serde_json::from_slice(&bytes).map_err(|e| ControlError::Decode(format!("{}: {}", method, e)))?;

        if let Some(error) = reply.get("error").filter(|e| !e.is_null()) {
            return Err(api_failure(error));
        }

        Ok(reply.get_mut("result").map(Value::take).unwrap_or(Value::Null))
    }

    /// Returns the current session, logging in if needed
    async fn session(&self) -> Result<String, ControlError> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.clone());
        }

        let result = self
            .rpc(
                "session.login_with_password",
                vec![json!(self.username), json!(self.password), json!("1.0"), json!("vmchannel")],
                self.request_timeout,
            )
            .await?;
        let session = result
            .as_str()
            .ok_or_else(|| ControlError::Decode("session reference is not a string".to_string()))?
            .to_string();

        info!("Logged in to toolstack at {}", self.socket_path.display());
        *guard = Some(session.clone());
        Ok(session)
    }

    /// Invokes a session-scoped call, re-logging in once on an expired session
    async fn call_with_timeout(
        &self,
        method: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, ControlError> {
        let session = self.session().await?;
        let mut params = vec![json!(session)];
        params.extend(args.iter().cloned());

        match self.rpc(method, params, timeout).await {
            Err(e) if e.is_code(SESSION_INVALID) => {
                warn!("Toolstack session expired during {}, logging in again", method);
                *self.session.lock().await = None;
                let session = self.session().await?;
                self.replay_registrations(&session).await?;

                let mut params = vec![json!(session)];
                params.extend(args);
                self.rpc(method, params, timeout).await
            }
            other => other,
        }
    }

    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, ControlError> {
        self.call_with_timeout(method, args, self.request_timeout).await
    }

    async fn call_as<T: DeserializeOwned>(&self, method: &str, args: Vec<Value>) -> Result<T, ControlError> {
        let value = self.call(method, args).await?;
        serde_json::from_value(value).map_err(|e| ControlError::Decode(format!("{}: {}", method, e)))
    }

    async fn replay_registrations(&self, session: &str) -> Result<(), ControlError> {
        let classes = self.registered.lock().await.clone();
        if classes.is_empty() {
            return Ok(());
        }
        self.rpc("event.register", vec![json!(session), json!(classes)], self.request_timeout)
            .await
            .map(|_| ())
    }
}

/// Converts a JSON-RPC error object into a toolstack failure
fn api_failure(error: &Value) -> ControlError {
    let code = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("UNKNOWN_ERROR")
        .to_string();
    let params = error
        .get("data")
        .and_then(Value::as_array)
        .map(|data| {
            data.iter()
                .map(|v| v.as_str().map(String::from).unwrap_or_else(|| v.to_string()))
                .collect()
        })
        .unwrap_or_default();

    ControlError::Api { code, params }
}

/// Reads a domain id that may be rendered as a number or a string
fn parse_domid(value: &Value) -> Result<i64, ControlError> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| ControlError::Decode(format!("domid out of range: {}", n))),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| ControlError::Decode(format!("domid is not an integer: {}", s))),
        other => Err(ControlError::Decode(format!("unexpected domid: {}", other))),
    }
}

#[async_trait]
impl ControlPlane for XapiClient {
    async fn vm_by_uuid(&self, uuid: &str) -> Result<ObjectRef, ControlError> {
        self.call_as("VM.get_by_uuid", vec![json!(uuid)]).await
    }

    async fn vm_records(&self) -> Result<HashMap<ObjectRef, VmRecord>, ControlError> {
        self.call_as("VM.get_all_records", vec![]).await
    }

    async fn vm_record(&self, vm: &ObjectRef) -> Result<VmRecord, ControlError> {
        self.call_as("VM.get_record", vec![json!(vm)]).await
    }

    async fn vm_domid(&self, vm: &ObjectRef) -> Result<i64, ControlError> {
        let value = self.call("VM.get_domid", vec![json!(vm)]).await?;
        parse_domid(&value)
    }

    async fn vm_vifs(&self, vm: &ObjectRef) -> Result<Vec<ObjectRef>, ControlError> {
        self.call_as("VM.get_VIFs", vec![json!(vm)]).await
    }

    async fn vm_other_config(&self, vm: &ObjectRef) -> Result<OtherConfig, ControlError> {
        self.call_as("VM.get_other_config", vec![json!(vm)]).await
    }

    async fn vm_add_to_other_config(&self, vm: &ObjectRef, key: &str, value: &str) -> Result<(), ControlError> {
        self.call("VM.add_to_other_config", vec![json!(vm), json!(key), json!(value)])
            .await
            .map(|_| ())
    }

    async fn vm_remove_from_other_config(&self, vm: &ObjectRef, key: &str) -> Result<(), ControlError> {
        self.call("VM.remove_from_other_config", vec![json!(vm), json!(key)])
            .await
            .map(|_| ())
    }

    async fn vm_xenstore_data(&self, vm: &ObjectRef) -> Result<OtherConfig, ControlError> {
        self.call_as("VM.get_xenstore_data", vec![json!(vm)]).await
    }

    async fn vm_set_xenstore_data(&self, vm: &ObjectRef, data: OtherConfig) -> Result<(), ControlError> {
        self.call("VM.set_xenstore_data", vec![json!(vm), json!(data)])
            .await
            .map(|_| ())
    }

    async fn vm_resident_on(&self, vm: &ObjectRef) -> Result<ObjectRef, ControlError> {
        self.call_as("VM.get_resident_on", vec![json!(vm)]).await
    }

    async fn vif_record(&self, vif: &ObjectRef) -> Result<VifRecord, ControlError> {
        self.call_as("VIF.get_record", vec![json!(vif)]).await
    }

    async fn vif_create(&self, spec: VifSpec) -> Result<ObjectRef, ControlError> {
        let spec = serde_json::to_value(&spec).map_err(|e| ControlError::Decode(e.to_string()))?;
        self.call_as("VIF.create", vec![spec]).await
    }

    async fn vif_plug(&self, vif: &ObjectRef) -> Result<(), ControlError> {
        self.call("VIF.plug", vec![json!(vif)]).await.map(|_| ())
    }

    async fn vif_unplug(&self, vif: &ObjectRef) -> Result<(), ControlError> {
        self.call("VIF.unplug", vec![json!(vif)]).await.map(|_| ())
    }

    async fn vif_destroy(&self, vif: &ObjectRef) -> Result<(), ControlError> {
        self.call("VIF.destroy", vec![json!(vif)]).await.map(|_| ())
    }

    async fn network_records(&self) -> Result<HashMap<ObjectRef, NetworkRecord>, ControlError> {
        self.call_as("network.get_all_records", vec![]).await
    }

    async fn host_by_uuid(&self, uuid: &str) -> Result<ObjectRef, ControlError> {
        self.call_as("host.get_by_uuid", vec![json!(uuid)]).await
    }

    async fn vm_metrics_records(&self) -> Result<HashMap<ObjectRef, VmMetricsRecord>, ControlError> {
        self.call_as("VM_metrics.get_all_records", vec![]).await
    }

    async fn event_register(&self, classes: &[&str]) -> Result<(), ControlError> {
        {
            let mut registered = self.registered.lock().await;
            for class in classes {
                if !registered.iter().any(|c| c == class) {
                    registered.push(class.to_string());
                }
            }
        }
        self.call("event.register", vec![json!(classes)]).await.map(|_| ())
    }

    async fn event_next(&self) -> Result<Vec<ObjectEvent>, ControlError> {
        match self.call_with_timeout("event.next", vec![], self.event_timeout).await {
            Ok(value) => serde_json::from_value(value).map_err(|e| ControlError::Decode(format!("event.next: {}", e))),
            Err(ControlError::Timeout(_)) => {
                debug!("No events within {:?}", self.event_timeout);
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }
}
