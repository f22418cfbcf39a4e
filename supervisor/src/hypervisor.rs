//! Hypervisor controller: builds the qemu argument vector from validated
//! configuration, launches and supervises the child process, and powers it
//! down over the QMP control socket.

use crate::config::Config;
use crate::error::SupervisorError;
use crate::qmp::QmpClient;
use crate::ringlog::RingLog;
use crate::torrc;
use async_trait::async_trait;
use rand::RngCore;
use rand::rngs::OsRng;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, watch};

pub const DEFAULT_QEMU_BINARY: &str = "qemu-system-x86_64";
pub const GUEST_MTU: u16 = 1500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accel {
    Kvm,
    Hvf,
    Whpx,
    Tcg,
}

impl Accel {
    pub fn as_arg(self) -> &'static str {
        match self {
            Accel::Kvm => "kvm",
            Accel::Hvf => "hvf",
            Accel::Whpx => "whpx",
            Accel::Tcg => "tcg",
        }
    }

    pub fn is_hardware(self) -> bool {
        !matches!(self, Accel::Tcg)
    }
}

/// Everything the argument builder needs, pulled out of [`Config`] with
/// the IP literals already parsed.
#[derive(Debug, Clone)]
pub struct VmSpec {
    pub memory_mb: u32,
    pub cpus: u32,
    pub kernel: PathBuf,
    pub initrd: PathBuf,
    pub state_disk: PathBuf,
    pub qmp_socket: PathBuf,
    pub tap_name: String,
    pub host_ip: Ipv4Addr,
    pub vm_ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub control_port: u16,
    pub accel: String,
    pub headless: bool,
    /// IOMMU with a split IRQ chip; only honored with KVM.
    pub iommu: bool,
}

impl VmSpec {
    pub fn from_config(config: &Config) -> Result<Self, SupervisorError> {
        Ok(Self {
            memory_mb: config.vm_memory_mb,
            cpus: config.vm_cpus,
            kernel: config.kernel_path.clone(),
            initrd: config.initrd_path.clone(),
            state_disk: config.state_disk_path.clone(),
            qmp_socket: config.qmp_socket_path.clone(),
            tap_name: config.tap_name.clone(),
            host_ip: config.host_ip_addr()?,
            vm_ip: config.vm_ip_addr()?,
            subnet_mask: config.subnet_mask_addr()?,
            control_port: config.control_port,
            accel: config.accel.clone(),
            headless: config.headless,
            iommu: false,
        })
    }
}

/// 32 bytes from the OS CSPRNG, hex-encoded, fresh per launch. The guest
/// seeds its pool from this before virtio-rng is up.
pub fn fresh_entropy() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn kernel_cmdline(spec: &VmSpec, entropy_hex: &str) -> String {
    format!(
        "quiet IP={} MASK={} GW={} MTU={} PRIVIP={} CTLSOCK={}:{} ENTROPY={}",
        spec.host_ip,
        spec.subnet_mask,
        spec.vm_ip,
        GUEST_MTU,
        spec.vm_ip,
        spec.vm_ip,
        spec.control_port,
        entropy_hex,
    )
}

pub fn detect_accel(requested: &str) -> Accel {
    match requested {
        "kvm" => return Accel::Kvm,
        "hvf" => return Accel::Hvf,
        "whpx" => return Accel::Whpx,
        "tcg" => return Accel::Tcg,
        _ => {}
    }

    #[cfg(target_os = "linux")]
    {
        if kvm_available() {
            return Accel::Kvm;
        }
    }
    #[cfg(target_os = "macos")]
    {
        if hv_support() {
            return Accel::Hvf;
        }
    }
    #[cfg(target_os = "windows")]
    {
        if whpx_available() {
            return Accel::Whpx;
        }
    }
    Accel::Tcg
}

#[cfg(target_os = "linux")]
fn kvm_available() -> bool {
    std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/kvm")
        .is_ok()
}

#[cfg(target_os = "macos")]
fn hv_support() -> bool {
    let mut value: i32 = 0;
    let mut len = std::mem::size_of::<i32>();
    let name = c"kern.hv_support";
    let rc = unsafe {
        libc::sysctlbyname(
            name.as_ptr(),
            &mut value as *mut _ as *mut libc::c_void,
            &mut len,
            std::ptr::null_mut(),
            0,
        )
    };
    rc == 0 && value == 1
}

#[cfg(target_os = "windows")]
fn whpx_available() -> bool {
    Path::new("C:\\Windows\\System32\\WinHvPlatform.dll").exists()
}

/// Deterministic argument vector for one launch. Paths are refused if they
/// carry a NUL byte; everything else was validated at config load.
pub fn build_args(spec: &VmSpec, entropy_hex: &str) -> Result<Vec<String>, SupervisorError> {
    for path in [&spec.kernel, &spec.initrd, &spec.state_disk, &spec.qmp_socket] {
        if path.to_string_lossy().contains('\0') {
            return Err(SupervisorError::HypervisorLaunch(format!(
                "path {:?} contains a NUL byte",
                path
            )));
        }
    }

    let accel = detect_accel(&spec.accel);
    let hardware = accel.is_hardware();
    let split_irqchip = spec.iommu && accel == Accel::Kvm;

    let mut machine = String::from("q35");
    if hardware {
        machine.push_str(if split_irqchip {
            ",kernel-irqchip=split"
        } else {
            ",kernel-irqchip=on"
        });
    }

    let mut netdev = format!(
        "tap,id=net0,ifname={},script=no,downscript=no",
        spec.tap_name
    );
    if accel == Accel::Kvm && Path::new("/dev/vhost-net").exists() {
        netdev.push_str(",vhost=on");
    }

    let mut args: Vec<String> = vec![
        "-machine".into(),
        machine,
        "-accel".into(),
        accel.as_arg().into(),
        "-m".into(),
        spec.memory_mb.to_string(),
        "-smp".into(),
        spec.cpus.to_string(),
        "-kernel".into(),
        spec.kernel.to_string_lossy().into_owned(),
        "-initrd".into(),
        spec.initrd.to_string_lossy().into_owned(),
        "-append".into(),
        kernel_cmdline(spec, entropy_hex),
        "-netdev".into(),
        netdev,
        "-device".into(),
        "virtio-net-pci,netdev=net0".into(),
        "-drive".into(),
        format!(
            "file={},if=virtio,format=raw",
            spec.state_disk.to_string_lossy()
        ),
        "-object".into(),
        "rng-random,id=rng0,filename=/dev/urandom".into(),
        "-device".into(),
        "virtio-rng-pci,rng=rng0".into(),
        "-device".into(),
        "virtio-balloon-pci".into(),
    ];

    if split_irqchip {
        args.push("-device".into());
        args.push("intel-iommu,intremap=on".into());
    }

    args.push("-qmp".into());
    args.push(format!(
        "unix:{},server,nowait",
        spec.qmp_socket.to_string_lossy()
    ));

    if spec.headless {
        args.push("-display".into());
        args.push("none".into());
    }
    args.push("-no-reboot".into());

    Ok(args)
}

#[async_trait]
pub trait VmHandle: Send + Sync {
    /// Completion signal; `Some(code)` once the child has exited.
    fn exit_status(&self) -> watch::Receiver<Option<i32>>;

    /// Graceful powerdown over the management protocol, bounded by
    /// `grace`; falls back to a forced kill.
    async fn shutdown(&self, grace: Duration) -> Result<(), SupervisorError>;

    async fn kill(&self) -> Result<(), SupervisorError>;
}

#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn launch(&self, config: &Config) -> Result<Box<dyn VmHandle>, SupervisorError>;
}

pub struct QemuController {
    binary: String,
    console: Arc<RingLog>,
}

impl QemuController {
    pub fn new(console: Arc<RingLog>) -> Self {
        Self {
            binary: DEFAULT_QEMU_BINARY.to_string(),
            console,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }
}

#[async_trait]
impl Hypervisor for QemuController {
    async fn launch(&self, config: &Config) -> Result<Box<dyn VmHandle>, SupervisorError> {
        let spec = VmSpec::from_config(config)?;

        // Bridge/proxy settings ride into the guest on its state disk.
        let overlay = torrc::render(&config.bridge, &config.proxy)?;
        if !overlay.is_empty() {
            let dir = spec.state_disk.parent().unwrap_or_else(|| Path::new("."));
            tokio::fs::write(dir.join(torrc::OVERRIDE_FILE_NAME), &overlay)
                .await
                .map_err(|e| {
                    SupervisorError::HypervisorLaunch(format!("writing torrc overlay: {e}"))
                })?;
        }

        let entropy = fresh_entropy();
        let args = build_args(&spec, &entropy)?;
        tracing::info!(binary = %self.binary, accel = detect_accel(&spec.accel).as_arg(), "launching hypervisor");
        tracing::debug!(?args, "hypervisor argument vector");

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                SupervisorError::HypervisorLaunch(format!("spawning {}: {e}", self.binary))
            })?;

        if let Some(out) = child.stdout.take() {
            tokio::spawn(pipe_console(out, self.console.clone()));
        }
        if let Some(err) = child.stderr.take() {
            tokio::spawn(pipe_console(err, self.console.clone()));
        }

        let child = Arc::new(Mutex::new(child));
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(reap_child(child.clone(), exit_tx));

        Ok(Box::new(QemuVm {
            child,
            exit: exit_rx,
            qmp_socket: spec.qmp_socket,
        }))
    }
}

async fn pipe_console<R: AsyncRead + Unpin>(reader: R, log: Arc<RingLog>) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        log.write(&line);
        log.write("\n");
    }
}

/// Poll-wait so the child stays killable from other tasks; `wait()` would
/// pin the `Child` behind one borrow for the whole VM lifetime.
async fn reap_child(child: Arc<Mutex<Child>>, exit_tx: watch::Sender<Option<i32>>) {
    loop {
        {
            let mut guard = child.lock().await;
            match guard.try_wait() {
                Ok(Some(status)) => {
                    let code = status.code().unwrap_or(-1);
                    tracing::info!(code, "hypervisor exited");
                    let _ = exit_tx.send(Some(code));
                    return;
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(error = %err, "lost track of the hypervisor child");
                    let _ = exit_tx.send(Some(-1));
                    return;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

pub struct QemuVm {
    child: Arc<Mutex<Child>>,
    exit: watch::Receiver<Option<i32>>,
    qmp_socket: PathBuf,
}

impl QemuVm {
    async fn graceful_powerdown(&self) -> Result<(), SupervisorError> {
        let mut qmp = QmpClient::connect(&self.qmp_socket).await?;
        let (status, running) = qmp.query_status().await?;
        tracing::debug!(status = %status, running, "powering the vm down");
        qmp.execute("system_powerdown").await?;
        let mut exit = self.exit.clone();
        exit.wait_for(|status| status.is_some())
            .await
            .map_err(|_| SupervisorError::ControlChannel {
                class: "Disconnected".to_string(),
                desc: "exit watcher dropped before the child finished".to_string(),
            })?;
        Ok(())
    }
}

#[async_trait]
impl VmHandle for QemuVm {
    fn exit_status(&self) -> watch::Receiver<Option<i32>> {
        self.exit.clone()
    }

    async fn shutdown(&self, grace: Duration) -> Result<(), SupervisorError> {
        if self.exit.borrow().is_some() {
            return Ok(());
        }
        match tokio::time::timeout(grace, self.graceful_powerdown()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "graceful powerdown failed; killing");
                self.kill().await
            }
            Err(_) => {
                tracing::warn!(grace = ?grace, "graceful powerdown timed out; killing");
                self.kill().await
            }
        }
    }

    async fn kill(&self) -> Result<(), SupervisorError> {
        if self.exit.borrow().is_some() {
            return Ok(());
        }
        {
            let mut guard = self.child.lock().await;
            if let Err(err) = guard.start_kill() {
                tracing::warn!(error = %err, "kill signal failed");
            }
        }
        let mut exit = self.exit.clone();
        let _ = tokio::time::timeout(
            Duration::from_secs(5),
            exit.wait_for(|status| status.is_some()),
        )
        .await;
        Ok(())
    }
}
