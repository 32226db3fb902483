use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::backend::PresenceBackend;
use crate::config::Settings;
use crate::device::{self, DeviceKind, ResolvedDevice, Resolver};
use crate::learning::{self, MacBindings};
use crate::messages::{Presence, Transition};
use crate::notify::{Notifier, Notify};
use crate::occupancy::OccupancyState;
use crate::probe;
use crate::schedule::{Scheduler, format_hms};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

pub struct Monitor {
    settings: Settings,
    backend: Arc<dyn PresenceBackend>,
    resolver: Box<dyn Resolver>,
    clock: Box<dyn Clock>,
    bindings: MacBindings,
    state: OccupancyState,
    scheduler: Scheduler,
    notifier: Box<dyn Notify>,
    seeding_done: bool,
    cancel: CancellationToken,
}

impl Monitor {
    pub fn new(
        settings: Settings,
        backend: Arc<dyn PresenceBackend>,
        resolver: Box<dyn Resolver>,
        cancel: CancellationToken,
    ) -> Self {
        Self::with_clock(settings, backend, resolver, Box::new(SystemClock), cancel)
    }

    pub fn with_clock(
        settings: Settings,
        backend: Arc<dyn PresenceBackend>,
        resolver: Box<dyn Resolver>,
        clock: Box<dyn Clock>,
        cancel: CancellationToken,
    ) -> Self {
        let devices: Vec<String> = settings.devices.iter().map(|d| d.to_string()).collect();
        info!(
            "Monitoring {} device{}: [{}]",
            devices.len(),
            if devices.len() == 1 { "" } else { "s" },
            devices.join(", ")
        );
        debug!(
            "Using ARP: {}, Reverse Lookup: {}, Ping count: {}",
            settings.use_arp, settings.reverse_lookup, settings.ping_count
        );
        debug!("Grace Period: {} mins", settings.grace_minutes());
        match &settings.off_peak {
            Some(off_peak) => debug!("Off Peak: {off_peak}"),
            None => debug!("Off Peak: Not set"),
        }
        debug!("Occupied policy: {:?}", settings.occupied);
        debug!("Sleep interval when vacant: {} secs", settings.vacant_sleep.as_secs());

        Monitor {
            bindings: MacBindings::new(&settings.devices),
            state: OccupancyState::new(settings.grace_period),
            scheduler: Scheduler::new(settings.occupied, settings.vacant_sleep, settings.off_peak),
            notifier: Box::new(Notifier::new(settings.notify_command.clone())),
            settings,
            backend,
            resolver,
            clock,
            seeding_done: false,
            cancel,
        }
    }

    #[cfg(test)]
    pub fn with_notifier(mut self, notifier: Box<dyn Notify>) -> Self {
        self.notifier = notifier;
        self
    }

    #[cfg(test)]
    pub fn state(&self) -> &OccupancyState {
        &self.state
    }

    /// One probe cycle: refresh MAC bindings from the neighbor table, then
    /// look for any device there, falling back to pings.
    pub async fn check_for_occupancy(&mut self) -> bool {
        let needs_table = self.settings.use_arp || !self.bindings.is_empty();
        let mut cache = if needs_table {
            probe::get_arp_cache(&*self.backend).await
        } else {
            Default::default()
        };
        if needs_table && cache.is_empty() {
            debug!("ARP cache is empty");
        }
        self.bindings.refresh(&cache);

        if !self.seeding_done {
            self.seeding_done = true;
            if !self.bindings.is_empty() && self.bindings.all_unbound() {
                match self.settings.subnet.or_else(|| learning::infer_subnet(&cache)) {
                    Some(subnet) => {
                        learning::seed_subnet(
                            self.backend.clone(),
                            subnet,
                            self.settings.seed_workers,
                            &self.cancel,
                        )
                        .await;
                        cache = probe::get_arp_cache(&*self.backend).await;
                        self.bindings.refresh(&cache);
                    }
                    None => warn!("No MAC address is in the ARP table and no subnet could be inferred"),
                }
            }
        }

        let devices = self.resolve_devices().await;

        let result = if self.settings.use_arp && probe::arp_contains_any(&devices, &cache) {
            true
        } else {
            probe::ping_check(
                &*self.backend,
                &devices,
                self.settings.ping_count,
                self.settings.randomize,
            )
            .await
        };

        if result {
            debug!("Occupancy Check: {result} (one or more devices within property)");
        } else {
            debug!("Occupancy Check: {result} (no devices within property)");
        }
        result
    }

    async fn resolve_devices(&self) -> Vec<ResolvedDevice> {
        let mut resolved = Vec::with_capacity(self.settings.devices.len());
        for monitored in &self.settings.devices {
            let entry = match monitored.kind {
                DeviceKind::Mac => ResolvedDevice {
                    name: monitored.id.clone(),
                    address: monitored.mac().and_then(|mac| self.bindings.ip_for(mac)),
                },
                DeviceKind::Hostname | DeviceKind::Ipv4 => {
                    device::resolve(monitored, &*self.resolver, self.settings.reverse_lookup).await
                }
            };
            resolved.push(entry);
        }
        resolved
    }

    /// Probe, re-confirm a fresh absence a few times, then feed the result
    /// into the state machine. True while devices are seen or the grace
    /// period has not yet run out.
    pub async fn property_is_occupied(&mut self) -> bool {
        let mut detected = self.check_for_occupancy().await;

        if !detected && self.state.in_occupied_run() {
            self.state.open_grace_window(self.clock.now());
            let attempts = self.settings.reconfirm_attempts;
            for attempt in 1..=attempts {
                if !self.pause(self.settings.reconfirm_interval).await {
                    break;
                }
                debug!("Re-confirming absence ({attempt}/{attempts})");
                if self.check_for_occupancy().await {
                    detected = true;
                    break;
                }
            }
        }

        let now = self.clock.now();
        self.state.observe(detected, now);
        self.state.is_occupied(now)
    }

    /// Sleep unless cancelled first. Returns false on cancellation.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    async fn presence_changed(&self, occupied: bool) {
        let transition = Transition {
            presence: Presence::from_occupied(occupied),
            prior: if occupied {
                self.state.vacant_period()
            } else {
                self.state.occupied_period()
            },
        };

        if occupied {
            info!("Property is occupied - vacant for {}", transition.elapsed());
        } else {
            info!("Property is vacant - occupied for {}", transition.elapsed());
        }

        if let Err(err) = self.notifier.notify(&transition).await {
            error!("Notification failed: {err}");
        }
    }

    pub async fn run_loop(mut self) -> anyhow::Result<()> {
        let cancel = self.cancel.clone();

        let mut occupied = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            occupied = self.property_is_occupied() => occupied,
        };
        let mut seen = self.state.devices_seen();
        info!(
            "Startup status: {}",
            if occupied { "Occupied" } else { "Vacant" }
        );

        loop {
            let plan = self.scheduler.next_interval(&self.clock.now(), seen);
            debug!(
                "Sleeping for {} seconds ({}){}",
                plan.duration.as_secs(),
                format_hms(plan.duration),
                if plan.off_peak { " [Off peak is active]" } else { "" }
            );
            if !self.pause(plan.duration).await {
                break;
            }

            let occupied_now = tokio::select! {
                _ = cancel.cancelled() => break,
                occupied = self.property_is_occupied() => occupied,
            };
            if cancel.is_cancelled() {
                break;
            }

            let seen_now = self.state.devices_seen();
            if seen && !seen_now {
                info!(
                    "Property appears to have been vacated - {} minute grace period commencing...",
                    self.settings.grace_minutes()
                );
                if let (Some(since), Some(checked)) =
                    (self.state.first_not_seen(), self.state.last_not_seen())
                {
                    debug!(
                        "Devices not seen since {} (last checked {})",
                        since.format("%H:%M:%S"),
                        checked.format("%H:%M:%S")
                    );
                }
            } else if !seen && seen_now {
                info!("Property now re-occupied");
                if let Some(at) = self.state.last_seen() {
                    debug!("Devices seen again at {}", at.format("%H:%M:%S"));
                }
            }
            seen = seen_now;

            if occupied_now != occupied {
                self.presence_changed(occupied_now).await;
                occupied = occupied_now;
            }
        }

        info!("Exiting monitor loop");
        Ok(())
    }
}
