//! Named process groups with ordered lifecycle.
//!
//! Groups carry a startup order; starting walks the order (then any
//! unordered members in discovery order) and stopping defaults to the
//! reverse. Per-member failures during a group pass are collected or
//! logged, never raised.
use std::{collections::HashSet, thread, time::Duration};

use tracing::{info, warn};

use crate::{
    error::{GroupError, StoreError},
    events::{CoreEvent, EventBus},
    store::{
        GroupRecord, HealthStatus, ProcessFilter, ProcessRecord, ProcessStatus, Store,
        now_ms, short_id,
    },
    supervisor::{StartSpec, Supervisor},
};

/// Options for a group start pass.
#[derive(Debug, Clone)]
pub struct StartGroupOptions {
    /// Pause between member start attempts.
    pub startup_delay: Duration,
    /// Leave already-running members untouched.
    pub skip_running: bool,
}

impl Default for StartGroupOptions {
    fn default() -> Self {
        Self {
            startup_delay: Duration::from_millis(1000),
            skip_running: true,
        }
    }
}

/// How a group stop pass walks its members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopStrategy {
    /// Reverse of the startup order.
    #[default]
    Reverse,
    /// Startup order.
    Sequential,
    /// All members at once.
    Parallel,
}

/// Options for a group stop pass.
#[derive(Debug, Clone, Default)]
pub struct StopGroupOptions {
    /// Member walk order.
    pub strategy: StopStrategy,
    /// Use the kill signal and its shorter watchdog.
    pub force: bool,
}

/// Aggregate counts for a group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupStatus {
    /// Members currently running.
    pub running: usize,
    /// Members stopped.
    pub stopped: usize,
    /// Members failed or crashed.
    pub failed: usize,
    /// Members whose last probe was healthy.
    pub healthy: usize,
}

/// Orchestrates group membership and ordered lifecycle passes.
pub struct GroupOrchestrator {
    store: std::sync::Arc<Store>,
    supervisor: Supervisor,
    bus: EventBus,
}

impl GroupOrchestrator {
    /// Builds an orchestrator over the shared store and supervisor.
    pub fn new(
        store: std::sync::Arc<Store>,
        supervisor: Supervisor,
        bus: EventBus,
    ) -> Self {
        Self {
            store,
            supervisor,
            bus,
        }
    }

    fn map_process_err(err: StoreError) -> GroupError {
        match err {
            StoreError::NotFound {
                entity: "process",
                id,
            } => GroupError::ProcessNotFound { id },
            other => GroupError::Store(other),
        }
    }

    /// Creates a group, optionally seeded with a startup order.
    pub fn create(
        &self,
        name: &str,
        description: Option<&str>,
        startup_order: Vec<String>,
    ) -> Result<GroupRecord, GroupError> {
        let rec = GroupRecord {
            id: short_id(name),
            name: name.to_string(),
            description: description.map(str::to_string),
            created_at: now_ms(),
            startup_order,
        };
        self.store.insert_group(&rec)?;
        info!("created group '{}' ({})", rec.name, rec.id);
        self.bus
            .publish(CoreEvent::GroupCreated { id: rec.id.clone() });
        Ok(rec)
    }

    /// All groups.
    pub fn list(&self) -> Result<Vec<GroupRecord>, GroupError> {
        Ok(self.store.list_groups()?)
    }

    /// One group.
    pub fn get(&self, id: &str) -> Result<GroupRecord, GroupError> {
        self.store
            .get_group(id)?
            .ok_or_else(|| GroupError::NotFound { id: id.to_string() })
    }

    /// Assigns a process to a group, appending it to the startup order when
    /// absent. A process leaves its previous group's order first; membership
    /// is exclusive.
    pub fn add(&self, process_id: &str, group_id: &str) -> Result<(), GroupError> {
        let group = self.get(group_id)?;
        let process = self
            .store
            .get_process(process_id)?
            .ok_or_else(|| GroupError::ProcessNotFound {
                id: process_id.to_string(),
            })?;

        if let Some(previous) = process.group_id
            && previous != group_id
            && let Some(old_group) = self.store.get_group(&previous)?
        {
            let pruned: Vec<String> = old_group
                .startup_order
                .into_iter()
                .filter(|member| member != process_id)
                .collect();
            self.store.update_group_order(&previous, &pruned)?;
        }

        self.store
            .set_process_group(process_id, Some(group_id))
            .map_err(Self::map_process_err)?;

        if !group.startup_order.iter().any(|m| m == process_id) {
            let mut order = group.startup_order;
            order.push(process_id.to_string());
            self.store.update_group_order(group_id, &order)?;
        }

        self.bus.publish(CoreEvent::ProcessAddedToGroup {
            process_id: process_id.to_string(),
            group_id: group_id.to_string(),
        });
        Ok(())
    }

    /// Clears a process's group membership and removes it from every
    /// startup order.
    pub fn remove(&self, process_id: &str) -> Result<(), GroupError> {
        self.store
            .set_process_group(process_id, None)
            .map_err(Self::map_process_err)?;

        for group in self.store.list_groups()? {
            if group.startup_order.iter().any(|m| m == process_id) {
                let pruned: Vec<String> = group
                    .startup_order
                    .into_iter()
                    .filter(|member| member != process_id)
                    .collect();
                self.store.update_group_order(&group.id, &pruned)?;
            }
        }

        self.bus.publish(CoreEvent::ProcessRemovedFromGroup {
            process_id: process_id.to_string(),
        });
        Ok(())
    }

    /// Members in startup order, then unordered members in discovery order.
    /// Orphan order entries with no surviving row are skipped.
    fn ordered_members(&self, group: &GroupRecord) -> Result<Vec<ProcessRecord>, GroupError> {
        let members = self.store.list_processes(&ProcessFilter {
            group_id: Some(group.id.clone()),
            ..ProcessFilter::default()
        })?;

        let mut ordered = Vec::with_capacity(members.len());
        let mut placed: HashSet<&str> = HashSet::new();
        for id in &group.startup_order {
            if let Some(member) = members.iter().find(|m| &m.id == id) {
                ordered.push(member.clone());
                placed.insert(member.id.as_str());
            }
        }
        for member in &members {
            if !placed.contains(member.id.as_str()) {
                ordered.push(member.clone());
            }
        }
        Ok(ordered)
    }

    /// Starts the group's members in order, collecting per-member failures.
    /// Returns every member that is running after the pass (started now or
    /// skipped as already running).
    pub fn start(
        &self,
        group_id: &str,
        options: &StartGroupOptions,
    ) -> Result<Vec<ProcessRecord>, GroupError> {
        let group = self.get(group_id)?;
        let members = self.ordered_members(&group)?;

        let mut started = Vec::new();
        let mut errors = Vec::new();
        let total = members.len();
        for (index, member) in members.into_iter().enumerate() {
            if options.skip_running && member.status == ProcessStatus::Running {
                started.push(member);
                continue;
            }

            match self.supervisor.start(StartSpec::from_record(&member)) {
                Ok(record) => started.push(record),
                Err(err) => {
                    warn!(
                        "group '{}' member '{}' failed to start: {err}",
                        group_id, member.id
                    );
                    errors.push(format!("{}: {err}", member.id));
                }
            }

            if index + 1 < total && !options.startup_delay.is_zero() {
                thread::sleep(options.startup_delay);
            }
        }

        if !errors.is_empty() {
            self.bus.publish(CoreEvent::GroupStartErrors {
                id: group_id.to_string(),
                errors,
            });
        }
        self.bus.publish(CoreEvent::GroupStarted {
            id: group_id.to_string(),
            started: started.iter().map(|rec| rec.id.clone()).collect(),
        });
        Ok(started)
    }

    /// Stops the group's members per the chosen strategy. Per-member errors
    /// are logged, not raised.
    pub fn stop(
        &self,
        group_id: &str,
        options: &StopGroupOptions,
    ) -> Result<(), GroupError> {
        let group = self.get(group_id)?;
        let mut members = self.ordered_members(&group)?;
        if options.strategy == StopStrategy::Reverse {
            members.reverse();
        }

        match options.strategy {
            StopStrategy::Reverse | StopStrategy::Sequential => {
                for member in &members {
                    if let Err(err) = self.supervisor.stop(&member.id, options.force) {
                        warn!(
                            "group '{}' member '{}' failed to stop: {err}",
                            group_id, member.id
                        );
                    }
                }
            }
            StopStrategy::Parallel => {
                let stoppers: Vec<_> = members
                    .iter()
                    .map(|member| {
                        let supervisor = self.supervisor.clone();
                        let id = member.id.clone();
                        let force = options.force;
                        thread::spawn(move || {
                            if let Err(err) = supervisor.stop(&id, force) {
                                warn!("parallel stop of '{id}' failed: {err}");
                            }
                        })
                    })
                    .collect();
                for stopper in stoppers {
                    let _ = stopper.join();
                }
            }
        }

        self.bus.publish(CoreEvent::GroupStopped {
            id: group_id.to_string(),
        });
        Ok(())
    }

    /// Aggregate counts across the group's members.
    pub fn status(&self, group_id: &str) -> Result<GroupStatus, GroupError> {
        let group = self.get(group_id)?;
        let members = self.ordered_members(&group)?;

        let mut status = GroupStatus::default();
        for member in &members {
            match member.status {
                ProcessStatus::Running => status.running += 1,
                ProcessStatus::Stopped => status.stopped += 1,
                ProcessStatus::Failed | ProcessStatus::Crashed => status.failed += 1,
                ProcessStatus::Starting => {}
            }
            if member.health_status == HealthStatus::Healthy {
                status.healthy += 1;
            }
        }
        Ok(status)
    }

    /// Deletes an empty group; a group with members fails with GroupNotEmpty.
    pub fn delete(&self, group_id: &str) -> Result<(), GroupError> {
        self.get(group_id)?;
        if self.store.group_member_count(group_id)? > 0 {
            return Err(GroupError::NotEmpty {
                id: group_id.to_string(),
            });
        }
        self.store.delete_group(group_id)?;
        info!("deleted group '{group_id}'");
        self.bus.publish(CoreEvent::GroupDeleted {
            id: group_id.to_string(),
        });
        Ok(())
    }
}
