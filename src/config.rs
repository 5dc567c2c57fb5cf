use std::time::Duration;

use crate::audio::AudioConfig;
use crate::device_link::control::ControlConfig;
use crate::device_link::telemetry::TelemetryConfig;
use crate::registry::RegistryConfig;
use crate::scheduler::SchedulerConfig;

/// 运行时可覆盖监听地址的环境变量
pub const BIND_ENV_OVERRIDE: &str = "RIG_RELAY_BIND";

#[derive(Debug, Clone)]
pub struct Config {
    // 中继服务监听地址
    pub bind: String,
    pub registry: RegistryConfig,
    pub telemetry: TelemetryConfig,
    pub control: ControlConfig,
    pub scheduler: SchedulerConfig,
    pub audio: AudioConfig,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        let bind = std::env::var(BIND_ENV_OVERRIDE).unwrap_or_else(|_| env!("RELAY_BIND").to_string());

        Ok(Self {
            bind,
            registry: RegistryConfig {
                max_clients: env!("RELAY_MAX_CLIENTS").parse()
                    .map_err(|_| "Failed to parse RELAY_MAX_CLIENTS")?,
                heartbeat_interval: Duration::from_secs(
                    env!("RELAY_HEARTBEAT_INTERVAL_SECS").parse()
                        .map_err(|_| "Failed to parse RELAY_HEARTBEAT_INTERVAL_SECS")?,
                ),
                queue_depth: env!("RELAY_CLIENT_QUEUE_DEPTH").parse()
                    .map_err(|_| "Failed to parse RELAY_CLIENT_QUEUE_DEPTH")?,
            },

            telemetry: TelemetryConfig {
                url: env!("TELEMETRY_URL").to_string(),
                sync_interval: Duration::from_millis(
                    env!("TELEMETRY_SYNC_INTERVAL_MS").parse()
                        .map_err(|_| "Failed to parse TELEMETRY_SYNC_INTERVAL_MS")?,
                ),
                read_timeout: Duration::from_millis(
                    env!("TELEMETRY_READ_TIMEOUT_MS").parse()
                        .map_err(|_| "Failed to parse TELEMETRY_READ_TIMEOUT_MS")?,
                ),
                reconnect_delay: Duration::from_secs(
                    env!("TELEMETRY_RECONNECT_DELAY_SECS").parse()
                        .map_err(|_| "Failed to parse TELEMETRY_RECONNECT_DELAY_SECS")?,
                ),
            },

            control: ControlConfig {
                address: env!("CONTROL_ADDRESS").to_string(),
                response_timeout: Duration::from_millis(
                    env!("CONTROL_RESPONSE_TIMEOUT_MS").parse()
                        .map_err(|_| "Failed to parse CONTROL_RESPONSE_TIMEOUT_MS")?,
                ),
            },

            scheduler: SchedulerConfig {
                status_interval: Duration::from_millis(
                    env!("CONTROL_STATUS_INTERVAL_MS").parse()
                        .map_err(|_| "Failed to parse CONTROL_STATUS_INTERVAL_MS")?,
                ),
                passband: env!("CONTROL_PASSBAND").parse()
                    .map_err(|_| "Failed to parse CONTROL_PASSBAND")?,
            },

            audio: AudioConfig {
                enabled: env!("AUDIO_ENABLED").parse()
                    .map_err(|_| "Failed to parse AUDIO_ENABLED")?,
                capture_device: env!("AUDIO_CAPTURE_DEVICE").to_string(),
                playback_device: env!("AUDIO_PLAYBACK_DEVICE").to_string(),
                sample_rate: env!("AUDIO_SAMPLE_RATE").parse()
                    .map_err(|_| "Failed to parse AUDIO_SAMPLE_RATE")?,
                channels: env!("AUDIO_CHANNELS").parse()
                    .map_err(|_| "Failed to parse AUDIO_CHANNELS")?,
                block_size: env!("AUDIO_BLOCK_SIZE").parse()
                    .map_err(|_| "Failed to parse AUDIO_BLOCK_SIZE")?,
                tx_format: env!("AUDIO_TX_FORMAT").to_string(),
            },
        })
    }
}
