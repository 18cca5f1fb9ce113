//! Command-line and environment configuration for `labgate serve`.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::notifier::DEFAULT_QUEUE_DEPTH;
use crate::orchestrator::OrchestratorConfig;
use crate::rate_limit::RateLimitConfig;
use crate::runtime::docker::DockerConfig;
use crate::runtime::RetryPolicy;
use crate::session::SESSION_TTL_SECS;

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// HTTP port
    #[arg(long, env = "LABGATE_PORT", default_value = "8080")]
    pub port: u16,

    /// Control-plane gRPC port
    #[arg(long, env = "LABGATE_GRPC_PORT", default_value = "50051")]
    pub grpc_port: u16,

    /// Address the control plane binds to
    #[arg(long, env = "LABGATE_GRPC_BIND", default_value = "127.0.0.1")]
    pub grpc_bind: IpAddr,

    /// Docker Engine address; the local socket (or DOCKER_HOST) when unset
    #[arg(long, env = "LABGATE_DOCKER_URL")]
    pub docker_url: Option<String>,

    /// Default lab image
    #[arg(long, env = "LABGATE_LAB_IMAGE", default_value = "gns3/gns3server:latest")]
    pub lab_image: String,

    /// Additional images clients may request
    #[arg(long, env = "LABGATE_ALLOWED_IMAGES", value_delimiter = ',')]
    pub allowed_images: Vec<String>,

    /// Port the GNS3 console listens on inside the container
    #[arg(long, env = "LABGATE_CONSOLE_PORT", default_value = "3080")]
    pub console_port: u16,

    /// Host name clients use to reach lab consoles
    #[arg(long, env = "LABGATE_PUBLIC_HOST", default_value = "127.0.0.1")]
    pub public_host: String,

    /// Memory limit per lab container in MiB (0 for none)
    #[arg(long, env = "LABGATE_LAB_MEMORY_MB", default_value = "2048")]
    pub lab_memory_mb: u64,

    /// JSON classroom roster
    #[arg(long, env = "LABGATE_ROSTER")]
    pub roster: Option<PathBuf>,

    /// Sliding session lifetime in seconds
    #[arg(long, env = "LABGATE_SESSION_TTL", default_value_t = SESSION_TTL_SECS)]
    pub session_ttl_secs: u64,

    /// Session store call timeout in milliseconds
    #[arg(long, env = "LABGATE_STORE_TIMEOUT_MS", default_value = "1500")]
    pub store_timeout_ms: u64,

    /// Container runtime call timeout in milliseconds
    #[arg(long, env = "LABGATE_RUNTIME_TIMEOUT_MS", default_value = "8000")]
    pub runtime_timeout_ms: u64,

    /// Attempts per runtime call, including the first
    #[arg(long, env = "LABGATE_RUNTIME_ATTEMPTS", default_value = "3")]
    pub runtime_attempts: u32,

    /// Base backoff between runtime retries in milliseconds
    #[arg(long, env = "LABGATE_RUNTIME_BACKOFF_MS", default_value = "200")]
    pub runtime_backoff_ms: u64,

    /// Strict tier: bucket capacity
    #[arg(long, env = "LABGATE_RATE_CAPACITY", default_value = "10")]
    pub rate_capacity: u32,

    /// Strict tier: tokens regained per refill interval
    #[arg(long, env = "LABGATE_RATE_REFILL", default_value = "10")]
    pub rate_refill: u32,

    /// Strict tier: refill interval in milliseconds
    #[arg(long, env = "LABGATE_RATE_INTERVAL_MS", default_value = "1000")]
    pub rate_interval_ms: u64,

    /// Strict tier: block duration in seconds
    #[arg(long, env = "LABGATE_RATE_BLOCK_SECS", default_value = "60")]
    pub rate_block_secs: u64,

    /// Read tier: bucket capacity
    #[arg(long, env = "LABGATE_READ_RATE_CAPACITY", default_value = "60")]
    pub read_rate_capacity: u32,

    /// Read tier: block duration in seconds
    #[arg(long, env = "LABGATE_READ_RATE_BLOCK_SECS", default_value = "5")]
    pub read_rate_block_secs: u64,

    /// Reclaim running labs idle for this many seconds
    #[arg(long, env = "LABGATE_IDLE_TIMEOUT", default_value = "7200")]
    pub idle_timeout_secs: u64,

    /// Seconds between reconciliation sweeps
    #[arg(long, env = "LABGATE_RECONCILE_INTERVAL", default_value = "30")]
    pub reconcile_interval_secs: u64,

    /// Allow several labs per user and classroom
    #[arg(long, env = "LABGATE_ALLOW_MULTIPLE")]
    pub allow_multiple: bool,

    /// Charge anonymous requests to the first X-Forwarded-For hop
    #[arg(long, env = "LABGATE_TRUST_FORWARDED_FOR")]
    pub trust_forwarded_for: bool,

    /// Origins allowed to call the API with credentials
    #[arg(long, env = "LABGATE_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Vec<String>,

    /// Per-connection realtime queue depth
    #[arg(long, env = "LABGATE_EVENT_QUEUE", default_value_t = DEFAULT_QUEUE_DEPTH)]
    pub event_queue: usize,
}

/// Typed settings for every component.
#[derive(Debug, Clone)]
pub struct Settings {
    pub http_port: u16,
    pub grpc_addr: SocketAddr,
    pub session_ttl: Duration,
    pub store_timeout: Duration,
    pub strict_rate: RateLimitConfig,
    pub read_rate: RateLimitConfig,
    pub orchestrator: OrchestratorConfig,
    pub docker: DockerConfig,
    pub reconcile_interval: Duration,
    pub roster: Option<PathBuf>,
    pub trust_forwarded_for: bool,
    pub cors_origins: Vec<String>,
    pub event_queue: usize,
}

impl ServeArgs {
    pub fn settings(&self) -> Settings {
        let runtime_timeout = Duration::from_millis(self.runtime_timeout_ms);
        let read = RateLimitConfig::read();
        Settings {
            http_port: self.port,
            grpc_addr: SocketAddr::new(self.grpc_bind, self.grpc_port),
            session_ttl: Duration::from_secs(self.session_ttl_secs),
            store_timeout: Duration::from_millis(self.store_timeout_ms),
            strict_rate: RateLimitConfig {
                capacity: self.rate_capacity,
                refill_amount: self.rate_refill,
                refill_interval: Duration::from_millis(self.rate_interval_ms),
                block_duration: Duration::from_secs(self.rate_block_secs),
            },
            read_rate: RateLimitConfig {
                capacity: self.read_rate_capacity,
                refill_amount: self.read_rate_capacity,
                block_duration: Duration::from_secs(self.read_rate_block_secs),
                ..read
            },
            orchestrator: OrchestratorConfig {
                default_image: self.lab_image.clone(),
                allowed_images: self.allowed_images.clone(),
                memory_mb: (self.lab_memory_mb > 0).then_some(self.lab_memory_mb),
                allow_multiple: self.allow_multiple,
                idle_timeout: Duration::from_secs(self.idle_timeout_secs),
                retry: RetryPolicy {
                    attempts: self.runtime_attempts.max(1),
                    base_delay: Duration::from_millis(self.runtime_backoff_ms),
                    call_timeout: runtime_timeout,
                    ..RetryPolicy::default()
                },
            },
            docker: DockerConfig {
                url: self.docker_url.as_deref().map(|u| u.trim_end_matches('/').to_string()),
                console_port: self.console_port,
                public_host: self.public_host.clone(),
                stop_grace: Duration::from_secs(10),
                request_timeout: runtime_timeout,
            },
            reconcile_interval: Duration::from_secs(self.reconcile_interval_secs.max(1)),
            roster: self.roster.clone(),
            trust_forwarded_for: self.trust_forwarded_for,
            cors_origins: self.cors_origins.clone(),
            event_queue: self.event_queue,
        }
    }
}
