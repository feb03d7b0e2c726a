//! # Process Supervisor
//!
//! Owns the lifecycle of the engine's child processes and the channel
//! registry that connects them. Children are launched from a typed spec
//! (kind, instance id, bootstrap IPC endpoint, resource budget, sandbox
//! policy); the supervisor routes commands over the fabric, observes
//! child death through channel errors, restarts crashed children with
//! bounded backoff, and drives orderly shutdown: stop intake, drain,
//! persist caches, close everything.
//!
//! The actual OS-level spawn (fork/exec, sandbox setup) belongs to the
//! embedding host behind [`ProcessLauncher`]; an in-process launcher is
//! provided for tests and single-process bring-up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cache::CompressionCache;
use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::ipc::{
    fabric::handler_fn, ChannelConfig, ChannelId, Endpoint, IpcFabric, Message, MessageKind,
    Priority, TransportKind,
};
use crate::net::dns::DnsResolver;
use crate::net::fetch::ResourceFetcher;
use crate::net::http3::{Http3Client, OriginEndpoint};
use crate::net::optimizer::NetworkOptimizer;
use crate::net::HstsStore;
use crate::persist::StateStore;
use crate::privacy::{PrivacyShield, ShieldPolicy};

/// Kinds of child processes the supervisor launches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessKind {
    Renderer,
    Network,
    Gpu,
    Utility,
    Extension,
    Storage,
    Audio,
}

/// Resource limits handed to the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceBudget {
    pub memory_bytes: u64,
    pub cpu_shares: u32,
}

impl Default for ResourceBudget {
    fn default() -> Self {
        Self {
            memory_bytes: 512 * 1024 * 1024,
            cpu_shares: 1024,
        }
    }
}

/// Sandbox restrictions for a child process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxPolicy {
    pub allowed_syscalls: Vec<String>,
    pub filesystem_roots: Vec<String>,
    pub allow_network: bool,
}

impl SandboxPolicy {
    /// The default policy for a process kind; only the network process
    /// may use the network, only storage sees the profile directory.
    pub fn for_kind(kind: ProcessKind) -> Self {
        match kind {
            ProcessKind::Network => Self {
                allowed_syscalls: vec!["socket".into(), "connect".into(), "sendmsg".into()],
                filesystem_roots: Vec::new(),
                allow_network: true,
            },
            ProcessKind::Storage => Self {
                allowed_syscalls: vec!["openat".into(), "fsync".into()],
                filesystem_roots: vec!["profile".into()],
                allow_network: false,
            },
            _ => Self::default(),
        }
    }
}

/// Everything a launcher needs to start one child.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub kind: ProcessKind,
    pub instance: Uuid,
    pub transport: TransportKind,
    /// Bootstrap IPC endpoint the child connects back to.
    pub endpoint: Endpoint,
    pub budget: ResourceBudget,
    pub sandbox: SandboxPolicy,
}

/// The seam to the host's process machinery.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Start the child described by `spec`. The child is expected to
    /// connect to `spec.endpoint` as its bootstrap channel.
    async fn launch(&self, spec: &ProcessSpec) -> CoreResult<()>;
}

/// Child lifecycle as the supervisor sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Launching,
    Running,
    Crashed,
    Stopped,
}

struct Child {
    spec: ProcessSpec,
    channel: ChannelId,
    state: ChildState,
    restarts: u32,
}

/// Restart attempts before a child is declared dead.
const MAX_RESTARTS: u32 = 3;
const RESTART_BACKOFF: Duration = Duration::from_millis(250);

/// The supervisor: subsystem owner and channel registry.
pub struct ProcessSupervisor {
    config: CoreConfig,
    fabric: Arc<IpcFabric>,
    launcher: Arc<dyn ProcessLauncher>,
    children: DashMap<Uuid, Child>,
    accepting: AtomicBool,

    resolver: Arc<DnsResolver>,
    optimizer: Arc<NetworkOptimizer>,
    http3: Arc<Http3Client>,
    cache: Arc<CompressionCache>,
    shield: Arc<PrivacyShield>,
    hsts: Arc<HstsStore>,
    fetcher: Arc<ResourceFetcher>,
    store: Option<StateStore>,
}

impl ProcessSupervisor {
    /// Build the supervisor and every subsystem from validated
    /// configuration.
    pub fn new(
        config: CoreConfig,
        launcher: Arc<dyn ProcessLauncher>,
        origin: Arc<dyn OriginEndpoint>,
        store: Option<StateStore>,
    ) -> CoreResult<Arc<Self>> {
        config.validate()?;

        let fabric = IpcFabric::new(config.ipc.clone());
        let resolver = DnsResolver::with_system_upstream(config.dns.clone());
        let optimizer = Arc::new(NetworkOptimizer::new());
        if let Some(name) = &config.network_profile {
            optimizer
                .activate_named(name)
                .ok_or_else(|| CoreError::Config(format!("unknown network profile {name}")))?;
        }
        let shield = PrivacyShield::new(ShieldPolicy::from_config(&config.privacy));
        let http3 = Http3Client::new(
            resolver.clone(),
            optimizer.clone(),
            origin,
            !config.privacy.disable_zero_rtt,
        );
        let cache = CompressionCache::new(config.compression.clone());
        let hsts = Arc::new(HstsStore::new());
        let fetcher = ResourceFetcher::new(
            shield.clone(),
            http3.clone(),
            cache.clone(),
            hsts.clone(),
            optimizer.clone(),
        );

        let supervisor = Arc::new(Self {
            config,
            fabric,
            launcher,
            children: DashMap::new(),
            accepting: AtomicBool::new(true),
            resolver,
            optimizer,
            http3,
            cache,
            shield,
            hsts,
            fetcher,
            store,
        });
        supervisor.restore_persisted();
        Ok(supervisor)
    }

    pub fn fabric(&self) -> Arc<IpcFabric> {
        self.fabric.clone()
    }

    pub fn resolver(&self) -> Arc<DnsResolver> {
        self.resolver.clone()
    }

    pub fn optimizer(&self) -> Arc<NetworkOptimizer> {
        self.optimizer.clone()
    }

    pub fn http3(&self) -> Arc<Http3Client> {
        self.http3.clone()
    }

    pub fn cache(&self) -> Arc<CompressionCache> {
        self.cache.clone()
    }

    pub fn shield(&self) -> Arc<PrivacyShield> {
        self.shield.clone()
    }

    pub fn hsts(&self) -> Arc<HstsStore> {
        self.hsts.clone()
    }

    /// The composed page-load fetch path.
    pub fn fetcher(&self) -> Arc<ResourceFetcher> {
        self.fetcher.clone()
    }

    /// Launch a child of `kind`, returning its instance id.
    pub async fn spawn(self: &Arc<Self>, kind: ProcessKind) -> CoreResult<Uuid> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(CoreError::ChannelClosed("supervisor is shutting down".into()));
        }
        let instance = Uuid::new_v4();
        let spec = ProcessSpec {
            kind,
            instance,
            transport: TransportKind::Memory,
            endpoint: Endpoint::path(format!("proc-{instance}")),
            budget: ResourceBudget::default(),
            sandbox: SandboxPolicy::for_kind(kind),
        };
        let channel = self.open_bootstrap_channel(&spec).await?;
        self.children.insert(
            instance,
            Child {
                spec,
                channel,
                state: ChildState::Running,
                restarts: 0,
            },
        );
        info!(?kind, %instance, "child process running");
        Ok(instance)
    }

    /// Route a navigation command to a renderer child and await its
    /// acknowledgement.
    pub async fn navigate(&self, instance: Uuid, url: &str) -> CoreResult<Vec<u8>> {
        let channel = {
            let child = self
                .children
                .get(&instance)
                .ok_or_else(|| CoreError::ChannelClosed(format!("no child {instance}")))?;
            if child.state != ChildState::Running {
                return Err(CoreError::ChannelClosed(format!(
                    "child {instance} is {:?}",
                    child.state
                )));
            }
            child.channel
        };
        let request = Message::new(MessageKind::Request, url.as_bytes().to_vec())
            .with_route("navigation.load")
            .with_priority(Priority::High);
        let response = self
            .fabric
            .send_and_await(channel, request, Some(self.config.ipc.default_timeout))
            .await?;
        Ok(response.payload)
    }

    /// Child state for diagnostics.
    pub fn child_state(&self, instance: Uuid) -> Option<ChildState> {
        self.children.get(&instance).map(|c| c.state)
    }

    /// Periodic maintenance: expired DNS entries, cache eviction, idle
    /// connections.
    pub fn start_maintenance(self: &Arc<Self>, interval: Duration) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !supervisor.accepting.load(Ordering::Acquire) {
                    return;
                }
                supervisor.resolver.sweep_expired();
                supervisor.cache.run_maintenance();
                supervisor.http3.sweep_idle().await;
            }
        });
    }

    /// Orderly shutdown: stop intake, persist, close channels, end the
    /// cookie session.
    pub async fn shutdown(&self) {
        info!("supervisor shutting down");
        self.accepting.store(false, Ordering::Release);
        self.persist();
        self.shield.jar().end_session();
        for mut child in self.children.iter_mut() {
            child.state = ChildState::Stopped;
        }
        self.fabric.close_all().await;
    }

    /// Write every subsystem's durable state.
    pub fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let save = |name: &str, result: CoreResult<()>| {
            if let Err(e) = result {
                warn!("failed to persist {name}: {e}");
            }
        };
        save("dns-cache", store.save("dns-cache", &self.resolver.snapshot()));
        save("hsts", store.save("hsts", &self.hsts.snapshot()));
        save(
            "tracker-stats",
            store.save("tracker-stats", &self.shield.block_statistics()),
        );
        save(
            "session-tickets",
            store.save("session-tickets", &self.http3.tickets.snapshot()),
        );
        save(
            "compression-cache",
            store.save("compression-cache", &self.cache.snapshot()),
        );
    }

    fn restore_persisted(&self) {
        let Some(store) = &self.store else {
            return;
        };
        self.resolver.restore(store.load_or_default("dns-cache"));
        self.hsts.restore(store.load_or_default("hsts"));
        self.shield
            .restore_statistics(store.load_or_default("tracker-stats"));
        self.http3
            .tickets
            .restore(store.load_or_default("session-tickets"));
        self.cache.restore(store.load_or_default("compression-cache"));
    }

    /// Open the listening bootstrap channel for a child and launch it.
    async fn open_bootstrap_channel(self: &Arc<Self>, spec: &ProcessSpec) -> CoreResult<ChannelId> {
        let channel = self.fabric.open(
            ChannelConfig::new(
                format!("{:?}-{}", spec.kind, spec.instance),
                spec.transport,
                spec.endpoint.clone(),
            )
            .listening(),
        );

        // Watch for channel-level failures: a dead bootstrap channel is
        // how the supervisor observes child death.
        let supervisor = self.clone();
        let instance = spec.instance;
        self.fabric.set_error_callback(
            channel,
            Arc::new(move |_, err| {
                if matches!(err, CoreError::ChannelClosed(_) | CoreError::Protocol(_)) {
                    supervisor.on_child_failure(instance);
                }
            }),
        )?;

        self.launcher.launch(spec).await?;
        self.fabric
            .wait_connected(channel, self.config.ipc.default_timeout)
            .await?;
        Ok(channel)
    }

    /// Mark the child crashed and schedule a restart with backoff.
    fn on_child_failure(self: &Arc<Self>, instance: Uuid) {
        let Some(mut child) = self.children.get_mut(&instance) else {
            return;
        };
        if child.state != ChildState::Running {
            return;
        }
        child.state = ChildState::Crashed;
        let restarts = child.restarts;
        drop(child);
        error!(%instance, restarts, "child process died");

        if !self.accepting.load(Ordering::Acquire) {
            return;
        }
        let supervisor = self.clone();
        tokio::spawn(async move {
            if restarts >= MAX_RESTARTS {
                error!(%instance, "restart budget exhausted; child stays down");
                if let Some(mut child) = supervisor.children.get_mut(&instance) {
                    child.state = ChildState::Stopped;
                }
                return;
            }
            let backoff = RESTART_BACKOFF * 2u32.saturating_pow(restarts);
            tokio::time::sleep(backoff).await;

            let spec = match supervisor.children.get(&instance) {
                Some(child) => child.spec.clone(),
                None => return,
            };
            match supervisor.open_bootstrap_channel(&spec).await {
                Ok(channel) => {
                    if let Some(mut child) = supervisor.children.get_mut(&instance) {
                        child.channel = channel;
                        child.state = ChildState::Running;
                        child.restarts = restarts + 1;
                    }
                    info!(%instance, "child process restarted");
                }
                Err(e) => {
                    error!(%instance, "child restart failed: {e}");
                    if let Some(mut child) = supervisor.children.get_mut(&instance) {
                        child.restarts = restarts + 1;
                        child.state = ChildState::Crashed;
                    }
                }
            }
        });
    }
}

/// In-process launcher: runs each "child" as a task on a child-side
/// fabric, answering navigation commands. Used by tests and
/// single-process bring-up; real hosts substitute an OS process spawner.
pub struct InProcessLauncher {
    child_fabric: Arc<IpcFabric>,
}

impl InProcessLauncher {
    pub fn new(ipc: crate::config::IpcConfig) -> Arc<Self> {
        Arc::new(Self {
            child_fabric: IpcFabric::new(ipc),
        })
    }
}

#[async_trait]
impl ProcessLauncher for InProcessLauncher {
    async fn launch(&self, spec: &ProcessSpec) -> CoreResult<()> {
        let mut config = ChannelConfig::new(
            format!("child-{}", spec.instance),
            spec.transport,
            spec.endpoint.clone(),
        );
        // The supervisor's listener may not have registered yet; retry
        // briefly instead of racing it.
        config.reconnect = Some(crate::ipc::ReconnectPolicy {
            max_attempts: 10,
            initial_backoff_ms: 20,
            max_backoff_ms: 200,
        });
        let channel = self.child_fabric.open(config);
        self.child_fabric.register_handler(
            channel,
            "navigation.load",
            handler_fn(|message| async move {
                let mut ack = b"loaded:".to_vec();
                ack.extend_from_slice(&message.payload);
                Some(message.response(ack))
            }),
        )?;
        self.child_fabric
            .wait_connected(channel, Duration::from_secs(5))
            .await?;
        Ok(())
    }
}
