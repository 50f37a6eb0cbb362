// src/trigger/mod.rs

//! Guest-start event loop.
//!
//! Watches `vm_metrics` events and treats a start time later than the one
//! recorded before the batch as a (re)boot. Started guests resident on this
//! host are handed to each configured [`TriggerAction`] in turn.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::channel::{ChannelClient, ChannelError, CHANNEL_TAG, MIGRATION_TAG};
use crate::context::DaemonContext;
use crate::isolation::{IsolationError, IsolationRules};
use crate::platform::inventory::{local_host_uuid, InventoryError};
use crate::platform::{ControlError, ControlPlane, ObjectEvent, ObjectRef, VmMetricsRecord, HANDLE_INVALID};

/// Event class carrying guest start times
pub const METRICS_CLASS: &str = "vm_metrics";

static START_TIME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d{8}T\d{2}:\d{2}:\d{2}Z").expect("static regex"));

/// Extracts a `YYYYMMDDTHH:MM:SSZ` timestamp from wherever it appears in
/// the field, e.g. inside an XML-RPC `DateTime` rendering
pub fn parse_start_time(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    let text = match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let found = START_TIME.find(&text)?;
    NaiveDateTime::parse_from_str(found.as_str(), "%Y%m%dT%H:%M:%SZ")
        .ok()
        .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
}

/// Something to do for the guests that started in a batch
#[async_trait]
pub trait TriggerAction: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Acts on the guests started in one batch
    async fn run(&self, started: &[ObjectRef]) -> Result<(), TriggerError>;
}

/// Re-runs channel setup for every started guest
pub struct ReSetup {
    ctx: Arc<DaemonContext>,
}

impl ReSetup {
    /// Re-setup through the channels of `ctx`
    pub fn new(ctx: Arc<DaemonContext>) -> Self {
        Self { ctx }
    }

    async fn resetup(&self, vm: &ObjectRef) -> Result<(), ChannelError> {
        let other_config = self.ctx.control.vm_other_config(vm).await?;
        if !other_config.contains_key(CHANNEL_TAG) || other_config.contains_key(MIGRATION_TAG) {
            debug!(vm = %vm, "channel not enabled, skipping re-setup");
            return Ok(());
        }

        let mut client = ChannelClient::for_ref(self.ctx.clone(), vm.clone()).await?;
        client.setup().await
    }
}

#[async_trait]
impl TriggerAction for ReSetup {
    fn name(&self) -> &'static str {
        "re-setup"
    }

    async fn run(&self, started: &[ObjectRef]) -> Result<(), TriggerError> {
        for vm in started {
            match self.resetup(vm).await {
                Ok(()) => info!(vm = %vm, "re-setup complete"),
                Err(ChannelError::Control(e)) if e.is_code(HANDLE_INVALID) => {
                    debug!(vm = %vm, "reference is not a guest, skipping");
                }
                Err(e) => error!(vm = %vm, error = %e, "re-setup failed"),
            }
        }
        Ok(())
    }
}

/// Recomputes the isolation rules after guests start
pub struct Refresh {
    rules: IsolationRules,
}

impl Refresh {
    /// Refreshes `rules` on every batch
    pub fn new(rules: IsolationRules) -> Self {
        Self { rules }
    }
}

#[async_trait]
impl TriggerAction for Refresh {
    fn name(&self) -> &'static str {
        "isolation-refresh"
    }

    async fn run(&self, started: &[ObjectRef]) -> Result<(), TriggerError> {
        self.rules.refresh(started).await?;
        Ok(())
    }
}

/// Decides which guests an event batch started
pub struct StartDetector {
    control: Arc<dyn ControlPlane>,
    host: ObjectRef,
}

impl StartDetector {
    /// Detects starts of guests resident on `host`
    pub fn new(control: Arc<dyn ControlPlane>, host: ObjectRef) -> Self {
        Self { control, host }
    }

    /// Resolves the local host from the inventory file
    pub async fn for_local_host(
        control: Arc<dyn ControlPlane>,
        inventory: &std::path::Path,
    ) -> Result<Self, TriggerError> {
        let uuid = local_host_uuid(inventory).await?;
        let host = control.host_by_uuid(&uuid).await?;
        info!(host = %host, uuid = %uuid, "watching guest starts on local host");
        Ok(Self::new(control, host))
    }

    /// Guests started in `events`, deduplicated in batch order
    pub async fn started_guests(
        &self,
        before: &HashMap<ObjectRef, VmMetricsRecord>,
        events: &[ObjectEvent],
    ) -> Result<Vec<ObjectRef>, TriggerError> {
        let mut metrics_started = Vec::new();

        for event in events.iter().filter(|e| e.class.eq_ignore_ascii_case(METRICS_CLASS)) {
            let Some(snapshot) = &event.snapshot else {
                continue;
            };
            let Some(start) = snapshot.get("start_time").and_then(parse_start_time) else {
                warn!(metrics = %event.object, "event carries no parsable start time");
                continue;
            };

            let started = match before.get(&event.object) {
                Some(previous) => match parse_start_time(&previous.start_time) {
                    Some(previous) => start > previous,
                    None => {
                        warn!(metrics = %event.object, "recorded start time is not parsable");
                        continue;
                    }
                },
                // Created after the snapshot, so any start is new
                None => true,
            };

            debug!(metrics = %event.object, start = %start, started, "start time compared");
            if started && !metrics_started.contains(&event.object) {
                metrics_started.push(event.object.clone());
            }
        }

        if metrics_started.is_empty() {
            return Ok(Vec::new());
        }

        let by_metrics: HashMap<ObjectRef, ObjectRef> = self
            .control
            .vm_records()
            .await?
            .into_iter()
            .filter_map(|(vm, rec)| rec.metrics.map(|m| (m, vm)))
            .collect();

        let mut guests = Vec::new();
        for metrics in metrics_started {
            let Some(vm) = by_metrics.get(&metrics) else {
                debug!(metrics = %metrics, "no guest owns these metrics");
                continue;
            };
            if guests.contains(vm) {
                continue;
            }
            match self.control.vm_resident_on(vm).await {
                Ok(host) if host == self.host => guests.push(vm.clone()),
                Ok(host) => debug!(vm = %vm, host = %host, "guest started on another host"),
                Err(e) => warn!(vm = %vm, error = %e, "cannot tell where guest runs"),
            }
        }

        Ok(guests)
    }
}

/// Event loop driving the trigger actions
pub struct TriggerLoop {
    control: Arc<dyn ControlPlane>,
    detector: StartDetector,
    actions: Vec<Box<dyn TriggerAction>>,
    retry_delay: Duration,
}

impl TriggerLoop {
    /// Runs `actions` in order for the guests `detector` reports started
    pub fn new(
        control: Arc<dyn ControlPlane>,
        detector: StartDetector,
        actions: Vec<Box<dyn TriggerAction>>,
        retry_delay: Duration,
    ) -> Self {
        Self {
            control,
            detector,
            actions,
            retry_delay,
        }
    }

    /// Re-setup followed by an isolation refresh, on the local host
    pub async fn standard(
        ctx: Arc<DaemonContext>,
        inventory: &std::path::Path,
        retry_delay: Duration,
    ) -> Result<Self, TriggerError> {
        let detector = StartDetector::for_local_host(ctx.control.clone(), inventory).await?;
        let actions: Vec<Box<dyn TriggerAction>> = vec![
            Box::new(ReSetup::new(ctx.clone())),
            Box::new(Refresh::new(IsolationRules::new(ctx.clone()))),
        ];
        Ok(Self::new(ctx.control.clone(), detector, actions, retry_delay))
    }

    /// Fetches and handles one batch of events, returning the guests it
    /// started
    pub async fn run_once(&self) -> Result<Vec<ObjectRef>, TriggerError> {
        let (before, events) = self.fetch().await?;
        self.handle(&before, &events).await
    }

    /// Snapshots the metrics records, then blocks for the next batch
    async fn fetch(&self) -> Result<(HashMap<ObjectRef, VmMetricsRecord>, Vec<ObjectEvent>), TriggerError> {
        let before = self.control.vm_metrics_records().await?;
        let events = self.control.event_next().await?;
        Ok((before, events))
    }

    #[instrument(skip_all, fields(events = events.len()))]
    async fn handle(
        &self,
        before: &HashMap<ObjectRef, VmMetricsRecord>,
        events: &[ObjectEvent],
    ) -> Result<Vec<ObjectRef>, TriggerError> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let started = self.detector.started_guests(before, events).await?;
        if started.is_empty() {
            return Ok(started);
        }

        info!(guests = ?started, "guests started");
        for action in &self.actions {
            if let Err(e) = action.run(&started).await {
                error!(action = action.name(), error = %e, "trigger action failed");
            }
        }
        Ok(started)
    }

    /// Runs until `shutdown` flips to true.
    ///
    /// Shutdown interrupts the wait for events but never a batch that is
    /// already being handled. Batch failures are logged and the loop carries
    /// on after a short pause.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), TriggerError> {
        self.control.event_register(&[METRICS_CLASS]).await?;
        info!("Listening for guest start events");

        while !*shutdown.borrow() {
            let fetched = tokio::select! {
                fetched = self.fetch() => fetched,
                _ = shutdown.changed() => break,
            };

            let result = match fetched {
                Ok((before, events)) => self.handle(&before, &events).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                error!(error = %e, "failed to process event batch");
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        info!("Event loop stopped");
        Ok(())
    }
}

/// Error raised by the trigger loop
#[derive(Error, Debug)]
pub enum TriggerError {
    /// Toolstack failure
    #[error(transparent)]
    Control(#[from] ControlError),

    /// Local host could not be identified
    #[error(transparent)]
    Inventory(#[from] InventoryError),

    /// Rule refresh failed
    #[error(transparent)]
    Isolation(#[from] IsolationError),
}
