use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use ganglion_core::config::MonitorConfig;

use crate::llm::{LlmClient, ServiceId};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MonitorError {
    #[error("no probe is registered for the {0} service")]
    NoProbe(ServiceId),
    #[error("{service} service still unavailable after {waited:?}")]
    OutageExceeded { service: ServiceId, waited: Duration },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MonitorSettings {
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub poll_interval: Duration,
    pub log_every_polls: u32,
    pub max_outage: Option<Duration>,
}

impl MonitorSettings {
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            probe_interval: Duration::from_millis(config.probe_interval_ms),
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            log_every_polls: config.log_every_polls.max(1),
            max_outage: config.max_outage_secs.map(Duration::from_secs),
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_millis(5000),
            probe_timeout: Duration::from_millis(2000),
            poll_interval: Duration::from_millis(500),
            log_every_polls: 20,
            max_outage: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub service: ServiceId,
    pub available: bool,
    pub probed: bool,
    pub unavailable_for_ms: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AvailabilitySnapshot {
    pub reasoning: ServiceStatus,
    pub negotiation: ServiceStatus,
}

struct ServiceSlot {
    available: AtomicBool,
    last_probe: Mutex<Option<Instant>>,
    unavailable_since: Mutex<Option<Instant>>,
    probe: Option<Arc<dyn LlmClient>>,
}

impl ServiceSlot {
    fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            last_probe: Mutex::new(None),
            unavailable_since: Mutex::new(None),
            probe: None,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Shared readiness flags for the completion backends.
///
/// Any number of execution loops read the flags; a loop that hits an outage
/// flips the flag and then waits in [`await_recovery`](Self::await_recovery),
/// which polls and probes at a bounded rate. Only the waiting task blocks.
pub struct ServiceAvailabilityMonitor {
    settings: MonitorSettings,
    slots: HashMap<ServiceId, ServiceSlot>,
}

impl ServiceAvailabilityMonitor {
    pub fn new(settings: MonitorSettings) -> Self {
        let slots = [ServiceId::Reasoning, ServiceId::Negotiation]
            .into_iter()
            .map(|service| (service, ServiceSlot::new()))
            .collect();
        Self { settings, slots }
    }

    /// Registers the client used to probe `service`. Call before sharing.
    pub fn with_probe(mut self, service: ServiceId, client: Arc<dyn LlmClient>) -> Self {
        if let Some(slot) = self.slots.get_mut(&service) {
            slot.probe = Some(client);
        }
        self
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    pub fn is_available(&self, service: ServiceId) -> bool {
        self.slot(service).map_or(true, |slot| slot.available.load(Ordering::Acquire))
    }

    pub fn report_unavailable(&self, service: ServiceId, reason: &str) {
        let Some(slot) = self.slot(service) else { return };
        if slot.available.swap(false, Ordering::AcqRel) {
            *lock(&slot.unavailable_since) = Some(Instant::now());
            warn!(
                event_name = "monitor.service.unavailable",
                service = %service,
                reason,
                "completion service marked unavailable"
            );
        }
    }

    pub fn report_available(&self, service: ServiceId) {
        let Some(slot) = self.slot(service) else { return };
        if !slot.available.swap(true, Ordering::AcqRel) {
            let since = lock(&slot.unavailable_since).take();
            info!(
                event_name = "monitor.service.recovered",
                service = %service,
                outage_ms = since.map(|at| at.elapsed().as_millis() as u64).unwrap_or_default(),
                "completion service available again"
            );
        }
    }

    /// Returns once `service` is available. Polls the shared flag and probes
    /// the backend at most once per probe interval across all waiters.
    pub async fn await_recovery(&self, service: ServiceId) -> Result<(), MonitorError> {
        let slot = self.slot(service).ok_or(MonitorError::NoProbe(service))?;
        if slot.probe.is_none() && !slot.available.load(Ordering::Acquire) {
            return Err(MonitorError::NoProbe(service));
        }

        let started = Instant::now();
        let mut polls: u32 = 0;
        loop {
            if slot.available.load(Ordering::Acquire) {
                debug!(
                    event_name = "monitor.wait.completed",
                    service = %service,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "recovery observed"
                );
                return Ok(());
            }

            if let Some(max_outage) = self.settings.max_outage {
                let since = (*lock(&slot.unavailable_since)).unwrap_or(started);
                let waited = since.elapsed();
                if waited >= max_outage {
                    warn!(
                        event_name = "monitor.wait.abandoned",
                        service = %service,
                        waited_ms = waited.as_millis() as u64,
                        "outage lasted longer than allowed"
                    );
                    return Err(MonitorError::OutageExceeded { service, waited });
                }
            }

            self.probe_if_due(service, slot).await;
            if slot.available.load(Ordering::Acquire) {
                continue;
            }

            polls += 1;
            if polls % self.settings.log_every_polls.max(1) == 0 {
                info!(
                    event_name = "monitor.waiting",
                    service = %service,
                    polls,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "still waiting for completion service"
                );
            }
            sleep(self.settings.poll_interval).await;
        }
    }

    pub fn snapshot(&self) -> AvailabilitySnapshot {
        AvailabilitySnapshot {
            reasoning: self.status(ServiceId::Reasoning),
            negotiation: self.status(ServiceId::Negotiation),
        }
    }

    /// Probes every registered backend once per probe interval so flags stay
    /// fresh even when no loop is waiting.
    pub fn spawn_probe_loop(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                for (service, slot) in &self.slots {
                    if slot.probe.is_some() {
                        self.probe_if_due(*service, slot).await;
                    }
                }
                sleep(self.settings.probe_interval).await;
            }
        })
    }

    fn slot(&self, service: ServiceId) -> Option<&ServiceSlot> {
        self.slots.get(&service)
    }

    fn status(&self, service: ServiceId) -> ServiceStatus {
        match self.slot(service) {
            Some(slot) => ServiceStatus {
                service,
                available: slot.available.load(Ordering::Acquire),
                probed: slot.probe.is_some(),
                unavailable_for_ms: (*lock(&slot.unavailable_since))
                    .map(|since| since.elapsed().as_millis() as u64),
            },
            None => ServiceStatus { service, available: true, probed: false, unavailable_for_ms: None },
        }
    }

    async fn probe_if_due(&self, service: ServiceId, slot: &ServiceSlot) {
        let Some(client) = slot.probe.clone() else { return };
        {
            let mut last_probe = lock(&slot.last_probe);
            let due = last_probe.map_or(true, |at| at.elapsed() >= self.settings.probe_interval);
            if !due {
                return;
            }
            *last_probe = Some(Instant::now());
        }

        match timeout(self.settings.probe_timeout, client.probe()).await {
            Ok(Ok(())) => self.report_available(service),
            Ok(Err(error)) if error.is_unavailable() => {
                debug!(
                    event_name = "monitor.probe.failed",
                    service = %service,
                    error = %error,
                    "probe found the service down"
                );
                self.report_unavailable(service, &error.to_string());
            }
            Ok(Err(error)) => {
                warn!(
                    event_name = "monitor.probe.rejected",
                    service = %service,
                    error = %error,
                    "probe reached the service but was rejected"
                );
                self.report_available(service);
            }
            Err(_) => {
                debug!(
                    event_name = "monitor.probe.timed_out",
                    service = %service,
                    timeout_ms = self.settings.probe_timeout.as_millis() as u64,
                    "probe timed out"
                );
                self.report_unavailable(service, "probe timed out");
            }
        }
    }
}
