//! Lifecycle engine.
//!
//! Drives the supervisor through privilege checks, network capture, VM
//! launch, reachability and bootstrap waits, steady state, and the
//! unconditional teardown sweep. Every state performs one externally
//! visible action; any fault engages the failsafe and redirects the run
//! into `Shutdown`, after which cancellation is absorbed and the remaining
//! cleanup states always execute.

use crate::config::Config;
use crate::error::SupervisorError;
use crate::failsafe::Failsafe;
use crate::hypervisor::{Hypervisor, VmHandle};
use crate::netadapter::{NetworkAdapter, SavedConfig};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Init,
    CheckPrivileges,
    SaveNetwork,
    CreateTap,
    LaunchVm,
    WaitTap,
    ConfigureTap,
    FlushDns,
    WaitBootstrap,
    Running,
    Shutdown,
    RestoreNetwork,
    Cleanup,
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Init => "init",
            LifecycleState::CheckPrivileges => "check-privileges",
            LifecycleState::SaveNetwork => "save-network",
            LifecycleState::CreateTap => "create-tap",
            LifecycleState::LaunchVm => "launch-vm",
            LifecycleState::WaitTap => "wait-tap",
            LifecycleState::ConfigureTap => "configure-tap",
            LifecycleState::FlushDns => "flush-dns",
            LifecycleState::WaitBootstrap => "wait-bootstrap",
            LifecycleState::Running => "running",
            LifecycleState::Shutdown => "shutdown",
            LifecycleState::RestoreNetwork => "restore-network",
            LifecycleState::Cleanup => "cleanup",
            LifecycleState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Probe and grace periods. Defaults are the production values; tests
/// shrink them.
#[derive(Debug, Clone)]
pub struct Timings {
    pub tap_wait: Duration,
    pub tap_interval: Duration,
    pub bootstrap_wait: Duration,
    pub bootstrap_interval: Duration,
    pub probe_attempt: Duration,
    pub shutdown_grace: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            tap_wait: Duration::from_secs(60),
            tap_interval: Duration::from_secs(1),
            bootstrap_wait: Duration::from_secs(300),
            bootstrap_interval: Duration::from_secs(2),
            probe_attempt: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

type Observer = Box<dyn Fn(LifecycleState, LifecycleState) + Send + Sync>;

enum Probe {
    Ready,
    TimedOut,
    Cancelled,
    VmExited(i32),
}

pub struct LifecycleEngine {
    config: Config,
    net: Arc<dyn NetworkAdapter>,
    hypervisor: Arc<dyn Hypervisor>,
    failsafe: Arc<Failsafe>,
    timings: Timings,
    observers: Vec<Observer>,
    state: LifecycleState,
    saved: Option<SavedConfig>,
    vm: Option<Box<dyn VmHandle>>,
    tap_created: bool,
    require_privileges: bool,
}

impl LifecycleEngine {
    pub fn new(
        config: Config,
        net: Arc<dyn NetworkAdapter>,
        hypervisor: Arc<dyn Hypervisor>,
    ) -> Self {
        let failsafe = Arc::new(Failsafe::new(net.clone()));
        Self {
            config,
            net,
            hypervisor,
            failsafe,
            timings: Timings::default(),
            observers: Vec::new(),
            state: LifecycleState::Init,
            saved: None,
            vm: None,
            tap_created: false,
            require_privileges: true,
        }
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    /// Packaging and test hook; the privilege demand stays on by default.
    pub fn require_privileges(mut self, required: bool) -> Self {
        self.require_privileges = required;
        self
    }

    pub fn on_transition<F>(&mut self, observer: F)
    where
        F: Fn(LifecycleState, LifecycleState) + Send + Sync + 'static,
    {
        self.observers.push(Box::new(observer));
    }

    pub fn failsafe(&self) -> Arc<Failsafe> {
        self.failsafe.clone()
    }

    /// Run to completion. Setting `cancel` to true stops the VM and
    /// restores the host; once the engine is in `Shutdown` the remaining
    /// cleanup states run regardless of further cancellation.
    pub async fn run(
        mut self,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), SupervisorError> {
        use LifecycleState as S;

        let mut fault: Option<SupervisorError> = None;

        // Refusal phase: nothing has been mutated yet, so a failure here
        // ends in Failed without the teardown sweep.
        for state in [S::CheckPrivileges, S::SaveNetwork] {
            if *cancel.borrow() {
                break;
            }
            self.transition(state);
            if let Err(err) = self.step(state, &mut cancel).await {
                tracing::error!(state = %state, error = %err, "lifecycle step failed");
                self.failsafe.activate().await;
                self.transition(S::Failed);
                return Err(err);
            }
        }

        if fault.is_none() {
            for state in [
                S::CreateTap,
                S::LaunchVm,
                S::WaitTap,
                S::ConfigureTap,
                S::FlushDns,
                S::WaitBootstrap,
            ] {
                if *cancel.borrow() {
                    break;
                }
                self.transition(state);
                if let Err(err) = self.step(state, &mut cancel).await {
                    tracing::error!(state = %state, error = %err, "lifecycle step failed");
                    self.failsafe.activate().await;
                    fault = Some(err);
                    break;
                }
            }
        }

        if fault.is_none() && !*cancel.borrow() {
            self.transition(S::Running);
            fault = self.run_steady(&mut cancel).await;
        }

        // From here on the engine no longer looks at `cancel`.
        self.transition(S::Shutdown);
        self.shutdown_vm().await;

        self.transition(S::RestoreNetwork);
        self.restore_network().await;

        self.failsafe.deactivate().await;
        self.transition(S::Cleanup);

        match fault {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    async fn step(
        &mut self,
        state: LifecycleState,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), SupervisorError> {
        use LifecycleState as S;
        match state {
            S::CheckPrivileges => {
                if self.require_privileges {
                    check_privileges()
                } else {
                    Ok(())
                }
            }
            S::SaveNetwork => {
                let saved = self.net.save_config().await.map_err(|err| {
                    SupervisorError::Privilege(format!("saving network configuration: {err}"))
                })?;
                tracing::info!(platform = saved.platform(), "network configuration saved");
                self.saved = Some(saved);
                Ok(())
            }
            S::CreateTap => {
                let host_ip = self.config.host_ip_addr()?;
                let vm_ip = self.config.vm_ip_addr()?;
                let mask = self.config.subnet_mask_addr()?;
                self.net
                    .create_tap(&self.config.tap_name, host_ip, vm_ip, mask)
                    .await?;
                self.tap_created = true;
                Ok(())
            }
            S::LaunchVm => {
                let vm = self.hypervisor.launch(&self.config).await?;
                self.vm = Some(vm);
                Ok(())
            }
            S::WaitTap => {
                let addr = SocketAddr::from((self.config.vm_ip_addr()?, self.config.control_port));
                match self
                    .wait_for_port(addr, self.timings.tap_wait, self.timings.tap_interval, cancel)
                    .await
                {
                    Probe::Ready | Probe::Cancelled => Ok(()),
                    Probe::VmExited(code) => Err(SupervisorError::VmExited(code)),
                    Probe::TimedOut => Err(SupervisorError::VmUnreachable(format!(
                        "{addr} did not answer within {:?}",
                        self.timings.tap_wait
                    ))),
                }
            }
            S::ConfigureTap => {
                self.net
                    .setup_routing(&self.config.tap_name, self.config.vm_ip_addr()?)
                    .await
            }
            S::FlushDns => {
                if let Err(err) = self.net.flush_dns().await {
                    tracing::warn!(error = %err, "dns cache flush failed");
                }
                Ok(())
            }
            S::WaitBootstrap => {
                let addr = SocketAddr::from((self.config.vm_ip_addr()?, self.config.socks_port));
                match self
                    .wait_for_port(
                        addr,
                        self.timings.bootstrap_wait,
                        self.timings.bootstrap_interval,
                        cancel,
                    )
                    .await
                {
                    Probe::Ready | Probe::Cancelled => Ok(()),
                    Probe::VmExited(code) => Err(SupervisorError::VmExited(code)),
                    Probe::TimedOut => {
                        Err(SupervisorError::BootstrapTimeout(self.timings.bootstrap_wait))
                    }
                }
            }
            _ => Ok(()),
        }
    }

    /// Steady state: the VM carries the host's traffic. Ends on external
    /// cancellation (clean) or unexpected child exit (fault).
    async fn run_steady(
        &mut self,
        cancel: &mut watch::Receiver<bool>,
    ) -> Option<SupervisorError> {
        self.failsafe.deactivate().await;

        let Some(vm) = self.vm.as_ref() else {
            return None;
        };
        let mut exit = vm.exit_status();

        if exit.borrow().is_none() {
            tokio::select! {
                _ = exit.wait_for(|status| status.is_some()) => {}
                _ = wait_cancelled(cancel) => {
                    tracing::info!("stop requested");
                    return None;
                }
            }
        }

        let code = (*exit.borrow()).unwrap_or(-1);
        tracing::error!(code, "vm exited while serving traffic");
        self.failsafe.activate().await;
        Some(SupervisorError::VmExited(code))
    }

    async fn shutdown_vm(&mut self) {
        if let Some(vm) = self.vm.take() {
            if let Err(err) = vm.shutdown(self.timings.shutdown_grace).await {
                tracing::warn!(error = %err, "graceful shutdown failed; forcing exit");
                if let Err(err) = vm.kill().await {
                    tracing::error!(error = %err, "failed to kill the hypervisor");
                }
            }
        }
    }

    /// All three restore operations run even when an earlier one errors.
    async fn restore_network(&mut self) {
        if let Err(err) = self.net.teardown_routing().await {
            tracing::warn!(error = %err, "removing diversion route failed");
        }
        if let Some(saved) = self.saved.take() {
            if let Err(err) = self.net.restore_config(saved).await {
                tracing::warn!(error = %err, "restoring saved network configuration failed");
            }
        }
        if self.tap_created {
            if let Err(err) = self.net.destroy_tap(&self.config.tap_name).await {
                tracing::warn!(error = %err, "destroying tap device failed");
            }
            self.tap_created = false;
        }
    }

    async fn wait_for_port(
        &self,
        addr: SocketAddr,
        total: Duration,
        interval: Duration,
        cancel: &mut watch::Receiver<bool>,
    ) -> Probe {
        let exit = self.vm.as_ref().map(|vm| vm.exit_status());
        let deadline = tokio::time::Instant::now() + total;
        loop {
            if let Some(rx) = &exit {
                if let Some(code) = *rx.borrow() {
                    return Probe::VmExited(code);
                }
            }
            if *cancel.borrow() {
                return Probe::Cancelled;
            }
            if let Ok(Ok(_)) =
                tokio::time::timeout(self.timings.probe_attempt, TcpStream::connect(addr)).await
            {
                tracing::debug!(%addr, "port is answering");
                return Probe::Ready;
            }
            if tokio::time::Instant::now() >= deadline {
                return Probe::TimedOut;
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.changed() => {}
            }
        }
    }

    fn transition(&mut self, to: LifecycleState) {
        let from = self.state;
        self.state = to;
        tracing::info!(%from, %to, "lifecycle transition");
        for observer in &self.observers {
            observer(from, to);
        }
    }
}

#[cfg(unix)]
fn check_privileges() -> Result<(), SupervisorError> {
    if nix::unistd::geteuid().is_root() {
        Ok(())
    } else {
        Err(SupervisorError::Privilege(
            "root is required to rewrite host routing".to_string(),
        ))
    }
}

// Without a uid concept we rely on the downstream network and hypervisor
// operations to fail informatively.
#[cfg(not(unix))]
fn check_privileges() -> Result<(), SupervisorError> {
    Ok(())
}

async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    while !*cancel.borrow() {
        if cancel.changed().await.is_err() {
            // Sender gone: treat as a stop request.
            return;
        }
    }
}
