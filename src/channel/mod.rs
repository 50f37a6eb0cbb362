// src/channel/mod.rs

//! Per-guest control channel.
//!
//! A [`ChannelClient`] owns one guest's channel: the dedicated management
//! interface, the configuration store subtree the guest service reads its
//! instructions from, and the credentials the guest publishes back. Key
//! operations go to the guest service over HTTP and resynchronise the whole
//! channel once when the guest stops accepting our credentials.

/// Guest-published service credentials
pub mod credentials;
/// Channel errors
pub mod error;
/// Bounded key/value records
pub mod record;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::{Body, Method, Request, StatusCode};
use tracing::{debug, info, instrument, warn};
use url::Url;

pub use credentials::Credentials;
pub use error::{ChannelError, ErrorKind};
pub use record::{validate_key, ChannelRecord, MAX_KEY_LEN, MAX_VALUE_LEN};

use crate::context::DaemonContext;
use crate::platform::store::{keys, ConfigStore, StorePaths};
use crate::platform::{
    internal_management_network, ObjectRef, StoreError, VifRecord, VifSpec, DOMID_NOT_RUNNING,
    MAP_DUPLICATE_KEY,
};
use crate::readiness::{poll_for, poll_until, PollOutcome};

/// Guest and interface tag marking an enabled channel
pub const CHANNEL_TAG: &str = "kvp_enabled";

/// Guest tag marking a migration in progress
pub const MIGRATION_TAG: &str = "kvpmigration_active";

/// MTU of the management interface
pub const MANAGEMENT_MTU: &str = "1504";

/// Attempts per key operation, counting the one after a resync
const MAX_ATTEMPTS: usize = 2;

/// Lifecycle of a guest's channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No channel has been set up
    Uninitialized,

    /// Tearing down the previous interface and tag
    Clearing,

    /// Creating the interface and waiting for the guest service
    Provisioning,

    /// Channel usable for key operations
    Ready,

    /// Torn down for a live migration
    Migrating,
}

/// A request against the guest's record service
#[derive(Debug, Clone)]
enum GuestRequest {
    Put(ChannelRecord),
    Get(Option<String>),
    Delete(String),
}

impl GuestRequest {
    fn method(&self) -> Method {
        match self {
            GuestRequest::Put(_) => Method::PUT,
            GuestRequest::Get(_) => Method::GET,
            GuestRequest::Delete(_) => Method::DELETE,
        }
    }

    /// Last path segment; empty addresses the whole collection
    fn key(&self) -> &str {
        match self {
            GuestRequest::Put(record) => record.key(),
            GuestRequest::Get(key) => key.as_deref().unwrap_or(""),
            GuestRequest::Delete(key) => key,
        }
    }
}

impl fmt::Display for GuestRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.method(), self.key())
    }
}

/// Manages the control channel of one guest
pub struct ChannelClient {
    ctx: Arc<DaemonContext>,
    vm: ObjectRef,
    uuid: String,
    domid: i64,
    paths: StorePaths,
    state: ChannelState,
    credentials: Option<Credentials>,
}

impl ChannelClient {
    /// Opens the channel of the guest with the given UUID
    pub async fn for_uuid(ctx: Arc<DaemonContext>, uuid: &str) -> Result<Self, ChannelError> {
        let vm = ctx.control.vm_by_uuid(uuid).await?;
        Self::for_ref(ctx, vm).await
    }

    /// Opens the channel of the guest behind a toolstack reference.
    ///
    /// Waits for the guest to obtain a domain id, since the store subtree is
    /// keyed by it.
    pub async fn for_ref(ctx: Arc<DaemonContext>, vm: ObjectRef) -> Result<Self, ChannelError> {
        let record = ctx.control.vm_record(&vm).await?;

        let state = if record.other_config.contains_key(MIGRATION_TAG) {
            ChannelState::Migrating
        } else if record.other_config.contains_key(CHANNEL_TAG) {
            ChannelState::Ready
        } else {
            ChannelState::Uninitialized
        };

        let domid = wait_for_domid(&ctx, &vm)
            .await
            .ok_or_else(|| ChannelError::GuestNotRunning(record.uuid.clone()))?;
        let paths = StorePaths::new(&ctx.settings.store_root_template, domid);

        debug!(vm = %vm, uuid = %record.uuid, domid, state = ?state, "opened guest channel");

        Ok(Self {
            ctx,
            vm,
            uuid: record.uuid,
            domid,
            paths,
            state,
            credentials: None,
        })
    }

    /// Toolstack reference of the guest
    pub fn vm(&self) -> &ObjectRef {
        &self.vm
    }

    /// Guest UUID
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Domain id the store subtree is keyed by
    pub fn domid(&self) -> i64 {
        self.domid
    }

    /// Current lifecycle state
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Credentials read by the last setup or key operation
    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Tears down any existing channel and provisions a fresh one
    #[instrument(skip(self), fields(vm = %self.vm, domid = self.domid))]
    pub async fn setup(&mut self) -> Result<(), ChannelError> {
        info!("Setting up guest channel");
        self.clear().await?;
        self.provision().await?;
        info!("Guest channel ready");
        Ok(())
    }

    /// Stores a record in the guest
    #[instrument(skip(self, record), fields(vm = %self.vm, key = %record.key()))]
    pub async fn put(&mut self, record: ChannelRecord) -> Result<(), ChannelError> {
        self.with_resync(GuestRequest::Put(record)).await.map(|_| ())
    }

    /// Reads one record, or every record when `key` is `None`.
    ///
    /// Values are text; a reply that is not UTF-8 fails with
    /// [`ChannelError::InvalidReply`].
    #[instrument(skip(self), fields(vm = %self.vm))]
    pub async fn get(&mut self, key: Option<&str>) -> Result<String, ChannelError> {
        if let Some(key) = key {
            validate_key(key)?;
        }
        self.with_resync(GuestRequest::Get(key.map(String::from))).await
    }

    /// Deletes one record from the guest
    #[instrument(skip(self), fields(vm = %self.vm))]
    pub async fn delete(&mut self, key: &str) -> Result<(), ChannelError> {
        validate_key(key)?;
        self.with_resync(GuestRequest::Delete(key.to_string())).await.map(|_| ())
    }

    /// Tears the channel down ahead of a live migration
    #[instrument(skip(self), fields(vm = %self.vm))]
    pub async fn prepare_migration(&mut self) -> Result<(), ChannelError> {
        let other_config = self.ctx.control.vm_other_config(&self.vm).await?;
        if !other_config.contains_key(CHANNEL_TAG) {
            return Err(ChannelError::Precondition(format!(
                "channel is not enabled for {}",
                self.uuid
            )));
        }

        self.clear().await?;
        self.add_tag(MIGRATION_TAG).await?;
        self.state = ChannelState::Migrating;
        info!("Guest channel prepared for migration");
        Ok(())
    }

    /// Re-establishes the channel after a live migration
    #[instrument(skip(self), fields(vm = %self.vm))]
    pub async fn finish_migration(&mut self) -> Result<(), ChannelError> {
        let other_config = self.ctx.control.vm_other_config(&self.vm).await?;
        if !other_config.contains_key(MIGRATION_TAG) {
            return Err(ChannelError::Precondition(format!(
                "no migration in progress for {}",
                self.uuid
            )));
        }

        self.ctx
            .control
            .vm_remove_from_other_config(&self.vm, MIGRATION_TAG)
            .await?;
        self.setup().await
    }

    /// Finds the guest's management interface.
    ///
    /// More than one tagged interface means the host state is corrupt and
    /// is reported as an error rather than picking one.
    pub async fn management_interface(&self) -> Result<Option<(ObjectRef, VifRecord)>, ChannelError> {
        let mut found = Vec::new();
        for vif in self.ctx.control.vm_vifs(&self.vm).await? {
            let record = self.ctx.control.vif_record(&vif).await?;
            if record.other_config.contains_key(CHANNEL_TAG) {
                found.push((vif, record));
            }
        }

        match found.len() {
            0 | 1 => Ok(found.pop()),
            n => Err(ChannelError::ManagementInterface(format!(
                "{} has {} management interfaces",
                self.uuid, n
            ))),
        }
    }

    /// Renders the store subtree for diagnostics
    pub async fn describe_store(&self) -> Result<String, ChannelError> {
        Ok(self.ctx.store.list(self.paths.root()).await?)
    }

    async fn clear(&mut self) -> Result<(), ChannelError> {
        self.state = ChannelState::Clearing;
        let control = &self.ctx.control;

        for vif in control.vm_vifs(&self.vm).await? {
            let record = control.vif_record(&vif).await?;
            if !record.other_config.contains_key(CHANNEL_TAG) {
                continue;
            }

            debug!(vif = %vif, mac = %record.mac, "removing management interface");
            // Halted guests have nothing plugged
            if let Err(e) = control.vif_unplug(&vif).await {
                debug!(vif = %vif, error = %e, "unplug failed, destroying anyway");
            }
            control.vif_destroy(&vif).await?;
        }

        control.vm_remove_from_other_config(&self.vm, CHANNEL_TAG).await?;
        self.credentials = None;
        Ok(())
    }

    async fn provision(&mut self) -> Result<(), ChannelError> {
        self.state = ChannelState::Provisioning;
        let control = self.ctx.control.clone();

        let network = internal_management_network(control.as_ref(), &self.ctx.settings.bridge).await?;
        let device = (control.vm_vifs(&self.vm).await?.len() + 1).to_string();
        let persisted_mac = control
            .vm_xenstore_data(&self.vm)
            .await?
            .get(&self.paths.boot_key(keys::NETWORK_DEVICE))
            .cloned()
            .unwrap_or_default();

        let spec = VifSpec {
            device,
            network,
            vm: self.vm.clone(),
            mac: persisted_mac,
            mtu: MANAGEMENT_MTU.to_string(),
            other_config: HashMap::from([(CHANNEL_TAG.to_string(), "true".to_string())]),
            qos_algorithm_type: String::new(),
            qos_algorithm_params: HashMap::new(),
        };
        let vif = control.vif_create(spec).await?;
        control.vif_plug(&vif).await?;

        let (_, iface) = self.management_interface().await?.ok_or_else(|| {
            ChannelError::ManagementInterface(format!("{} has no management interface after create", self.uuid))
        })?;
        info!(vif = %vif, mac = %iface.mac, device = %iface.device, "management interface plugged");

        self.persist_binding(&iface.mac).await?;

        let store = self.ctx.store.as_ref();
        store.write(&self.paths.key(keys::NETWORK_DEVICE), &iface.mac).await?;
        store.write(&self.paths.key(keys::RESTART), "1").await?;

        let outcome = poll_until(
            self.ctx.settings.liveness_timeout,
            self.ctx.settings.poll_interval,
            || service_alive(store, &self.paths),
        )
        .await;
        if outcome == PollOutcome::TimedOut {
            warn!(timeout = ?self.ctx.settings.liveness_timeout, "guest service did not restart in time");
        }

        match Credentials::read(store, &self.paths).await {
            Ok(creds) => self.credentials = Some(creds),
            Err(e) => warn!(error = %e, "guest service credentials not available yet"),
        }

        self.add_tag(CHANNEL_TAG).await?;
        self.state = ChannelState::Ready;
        Ok(())
    }

    /// Records the MAC binding in the guest's boot-time store data so the
    /// toolstack recreates the subtree on every boot.
    async fn persist_binding(&self, mac: &str) -> Result<(), ChannelError> {
        let control = &self.ctx.control;
        let mut data = control.vm_xenstore_data(&self.vm).await?;
        let device_key = self.paths.boot_key(keys::NETWORK_DEVICE);
        let restart_key = self.paths.boot_key(keys::RESTART);

        let up_to_date = data.get(&device_key).map(String::as_str) == Some(mac)
            && data.get(&restart_key).map(String::as_str) == Some("1");
        if up_to_date {
            debug!(mac = %mac, "binding already persisted");
            return Ok(());
        }

        data.insert(device_key, mac.to_string());
        data.insert(restart_key, "1".to_string());
        control.vm_set_xenstore_data(&self.vm, data).await?;

        // Recreate the subtree owned by the guest so it can write back
        let store = &self.ctx.store;
        let root = self.paths.root();
        match store.remove(root).await {
            Ok(()) | Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        store.write(root, "").await?;
        store.chmod(root, &format!("n{}", self.domid)).await?;

        info!(mac = %mac, "persisted management interface binding");
        Ok(())
    }

    async fn add_tag(&self, tag: &str) -> Result<(), ChannelError> {
        match self.ctx.control.vm_add_to_other_config(&self.vm, tag, "true").await {
            Ok(()) => Ok(()),
            Err(e) if e.is_code(MAP_DUPLICATE_KEY) => {
                debug!(tag = %tag, "tag already present");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Runs a request, resynchronising the channel once on expired auth
    async fn with_resync(&mut self, request: GuestRequest) -> Result<String, ChannelError> {
        let mut attempt = 1;
        loop {
            match self.send(&request).await {
                Err(e) if e.kind() == ErrorKind::AuthExpired && attempt < MAX_ATTEMPTS => {
                    warn!(request = %request, attempt, "guest rejected credentials, re-running setup");
                    self.setup().await?;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn send(&mut self, request: &GuestRequest) -> Result<String, ChannelError> {
        let settings = &self.ctx.settings;
        let store = self.ctx.store.as_ref();

        let outcome = poll_until(settings.service_timeout, settings.poll_interval, || {
            service_alive(store, &self.paths)
        })
        .await;
        if !outcome.is_ready() {
            match self.describe_store().await {
                Ok(dump) => debug!(store = %dump, "guest service is not attached"),
                Err(e) => debug!(error = %e, "failed to list channel store subtree"),
            }
            return Err(ChannelError::ServiceUnreachable(self.uuid.clone()));
        }

        let creds = Credentials::read(store, &self.paths).await?;
        let url = record_url(&creds.url, request.key())?;

        let mut builder = Request::builder()
            .method(request.method())
            .uri(url.as_str())
            .header(AUTHORIZATION, creds.basic_auth());
        let body = match request {
            GuestRequest::Put(record) => {
                builder = builder.header(CONTENT_TYPE, "text/plain");
                Body::from(record.value().to_string())
            }
            _ => Body::empty(),
        };
        let req = builder
            .body(body)
            .map_err(|e| ChannelError::Transport(e.to_string()))?;

        debug!(request = %request, url = %url, "sending request to guest service");
        let response = tokio::time::timeout(settings.request_timeout, self.ctx.http.request(req))
            .await
            .map_err(|_| ChannelError::Transport(format!("request to {} timed out", url)))?
            .map_err(|e| ChannelError::Transport(e.to_string()))?;

        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        self.credentials = Some(creds);

        match status {
            s if s.is_success() => String::from_utf8(bytes.to_vec())
                .map_err(|_| ChannelError::InvalidReply(format!("{} returned a non UTF-8 value", request))),
            StatusCode::UNAUTHORIZED => Err(ChannelError::AuthExpired),
            StatusCode::NOT_FOUND => Err(ChannelError::RecordNotFound(request.key().to_string())),
            s => Err(ChannelError::Http { status: s.as_u16() }),
        }
    }
}

/// Whether the guest service reports itself attached
async fn service_alive(store: &dyn ConfigStore, paths: &StorePaths) -> bool {
    let status = store.read(&paths.key(keys::DAEMON_STATUS)).await;
    let restart = store.read(&paths.key(keys::RESTART)).await;
    matches!((status.as_deref(), restart.as_deref()), (Ok("0"), Ok("0")))
}

async fn wait_for_domid(ctx: &DaemonContext, vm: &ObjectRef) -> Option<i64> {
    let control = ctx.control.as_ref();
    poll_for(ctx.settings.domid_timeout, ctx.settings.domid_poll_interval, || async {
        match control.vm_domid(vm).await {
            Ok(domid) if domid != DOMID_NOT_RUNNING => Some(domid),
            Ok(_) => {
                debug!(vm = %vm, "guest has no domain id yet");
                None
            }
            Err(e) => {
                warn!(vm = %vm, error = %e, "failed to read domain id");
                None
            }
        }
    })
    .await
}

fn record_url(base: &str, key: &str) -> Result<Url, ChannelError> {
    let mut url = Url::parse(base).map_err(|_| ChannelError::InvalidEndpoint(base.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| ChannelError::InvalidEndpoint(base.to_string()))?
        .push(key);
    Ok(url)
}
