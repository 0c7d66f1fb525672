use std::path::PathBuf;
use std::time::Duration;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

fn _default_true() -> bool {
    true
}

fn _default_false() -> bool {
    false
}

fn _default_outgoing_capacity() -> usize {
    1000
}

fn _default_incoming_capacity() -> usize {
    100
}

fn _default_payload_size() -> usize {
    1024
}

fn _default_resend_interval() -> Duration {
    Duration::from_millis(100)
}

fn _default_rtt() -> Duration {
    Duration::from_millis(100)
}

fn _default_rtt_variation() -> Duration {
    Duration::ZERO
}

fn _default_rto() -> Duration {
    Duration::from_millis(100)
}

fn _default_rto_max() -> Duration {
    Duration::from_secs(1)
}

fn _default_rtt_alpha() -> f64 {
    0.125
}

fn _default_rtt_beta() -> f64 {
    0.25
}

fn _default_clock_granularity() -> Duration {
    Duration::from_millis(10)
}

fn _default_drain_timeout() -> Duration {
    Duration::from_secs(2)
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StreamConfig {
    #[serde(default = "_default_outgoing_capacity")]
    pub outgoing_buffer_capacity: usize,

    #[serde(default = "_default_incoming_capacity")]
    pub incoming_buffer_capacity: usize,

    /// Maximum payload carried by one stream-data frame.
    #[serde(default = "_default_payload_size")]
    pub stream_data_payload_size: usize,

    #[serde(default = "_default_resend_interval", with = "humantime_serde")]
    pub resend_interval: Duration,

    #[serde(default = "_default_rtt", with = "humantime_serde")]
    pub initial_round_trip_time: Duration,

    #[serde(default = "_default_rtt_variation", with = "humantime_serde")]
    pub initial_round_trip_time_variation: Duration,

    #[serde(default = "_default_rto", with = "humantime_serde")]
    pub initial_retransmission_timeout: Duration,

    #[serde(default = "_default_rto_max", with = "humantime_serde")]
    pub max_retransmission_timeout: Duration,

    #[serde(default = "_default_rtt_alpha")]
    pub round_trip_time_alpha: f64,

    #[serde(default = "_default_rtt_beta")]
    pub round_trip_time_beta: f64,

    #[serde(default = "_default_clock_granularity", with = "humantime_serde")]
    pub clock_granularity: Duration,

    /// Bound on waiting for unacknowledged frames when shutting down.
    #[serde(default = "_default_drain_timeout", with = "humantime_serde")]
    pub drain_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            outgoing_buffer_capacity: _default_outgoing_capacity(),
            incoming_buffer_capacity: _default_incoming_capacity(),
            stream_data_payload_size: _default_payload_size(),
            resend_interval: _default_resend_interval(),
            initial_round_trip_time: _default_rtt(),
            initial_round_trip_time_variation: _default_rtt_variation(),
            initial_retransmission_timeout: _default_rto(),
            max_retransmission_timeout: _default_rto_max(),
            round_trip_time_alpha: _default_rtt_alpha(),
            round_trip_time_beta: _default_rtt_beta(),
            clock_granularity: _default_clock_granularity(),
            drain_timeout: _default_drain_timeout(),
        }
    }
}

fn _default_retry_initial_delay() -> Duration {
    Duration::from_millis(100)
}

fn _default_retry_ratio() -> f64 {
    2.0
}

fn _default_retry_jitter_ratio() -> f64 {
    0.1
}

fn _default_retry_max_delay() -> Duration {
    Duration::from_secs(5)
}

fn _default_retry_max_attempts() -> u32 {
    5
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "_default_retry_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,

    #[serde(default = "_default_retry_ratio")]
    pub ratio: f64,

    #[serde(default = "_default_retry_jitter_ratio")]
    pub jitter_ratio: f64,

    #[serde(default = "_default_retry_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    #[serde(default = "_default_retry_max_attempts")]
    pub max_attempts: u32,

    /// Error substrings that abort retrying immediately.
    #[serde(default)]
    pub non_retryable: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            initial_delay: _default_retry_initial_delay(),
            ratio: _default_retry_ratio(),
            jitter_ratio: _default_retry_jitter_ratio(),
            max_delay: _default_retry_max_delay(),
            max_attempts: _default_retry_max_attempts(),
            non_retryable: vec![],
        }
    }
}

fn _default_handshake_timeout() -> Duration {
    Duration::from_secs(15)
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HandshakeConfig {
    #[serde(default = "_default_handshake_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        HandshakeConfig {
            timeout: _default_handshake_timeout(),
        }
    }
}

fn _default_session_data_dir() -> PathBuf {
    "./data/sessions".into()
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ShellConfig {
    /// Directory for per-session shadow logs handed to the log uploader.
    #[serde(default = "_default_session_data_dir")]
    pub session_data_dir: PathBuf,
}

impl Default for ShellConfig {
    fn default() -> Self {
        ShellConfig {
            session_data_dir: _default_session_data_dir(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct PortConfig {
    /// Destinations that port sessions must never reach.
    #[serde(default)]
    pub denied_destinations: Vec<IpNet>,
}

fn _default_health_socket() -> PathBuf {
    "./data/worker-health.sock".into()
}

fn _default_termination_socket() -> PathBuf {
    "./data/worker-termination.sock".into()
}

fn _default_health_frequency() -> Duration {
    Duration::from_secs(300)
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WorkerConfig {
    #[serde(default = "_default_health_socket")]
    pub health_socket: PathBuf,

    #[serde(default = "_default_termination_socket")]
    pub termination_socket: PathBuf,

    #[serde(default = "_default_health_frequency", with = "humantime_serde")]
    pub health_frequency: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            health_socket: _default_health_socket(),
            termination_socket: _default_termination_socket(),
            health_frequency: _default_health_frequency(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct TlsConfig {
    /// Extra PEM bundle trusted in addition to the system roots.
    #[serde(default)]
    pub custom_ca_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AgentConfig {
    #[serde(default)]
    pub region: String,

    #[serde(default)]
    pub instance_id: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct OpsgateConfig {
    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub handshake: HandshakeConfig,

    #[serde(default)]
    pub shell: ShellConfig,

    #[serde(default)]
    pub port: PortConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub tls: TlsConfig,
}
