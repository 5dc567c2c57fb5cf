use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    relay: Relay,
    telemetry: Telemetry,
    control: Control,
    audio: Audio,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Relay {
    bind: String,
    max_clients: usize,
    heartbeat_interval_secs: u64,
    client_queue_depth: usize,
}

#[derive(Deserialize)]
struct Telemetry {
    url: String,
    sync_interval_ms: u64,
    read_timeout_ms: u64,
    reconnect_delay_secs: u64,
}

#[derive(Deserialize)]
struct Control {
    address: String,
    response_timeout_ms: u64,
    status_interval_ms: u64,
    passband: u32,
}

#[derive(Deserialize)]
struct Audio {
    enabled: bool,
    capture_device: String,
    playback_device: String,
    sample_rate: u32,
    channels: u32,
    block_size: usize,
    tx_format: String,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // 中继服务配置
    println!("cargo:rustc-env=RELAY_BIND={}", config.relay.bind);
    println!("cargo:rustc-env=RELAY_MAX_CLIENTS={}", config.relay.max_clients);
    println!("cargo:rustc-env=RELAY_HEARTBEAT_INTERVAL_SECS={}", config.relay.heartbeat_interval_secs);
    println!("cargo:rustc-env=RELAY_CLIENT_QUEUE_DEPTH={}", config.relay.client_queue_depth);

    // 电表遥测配置
    println!("cargo:rustc-env=TELEMETRY_URL={}", config.telemetry.url);
    println!("cargo:rustc-env=TELEMETRY_SYNC_INTERVAL_MS={}", config.telemetry.sync_interval_ms);
    println!("cargo:rustc-env=TELEMETRY_READ_TIMEOUT_MS={}", config.telemetry.read_timeout_ms);
    println!("cargo:rustc-env=TELEMETRY_RECONNECT_DELAY_SECS={}", config.telemetry.reconnect_delay_secs);

    // rigctld 控制配置
    println!("cargo:rustc-env=CONTROL_ADDRESS={}", config.control.address);
    println!("cargo:rustc-env=CONTROL_RESPONSE_TIMEOUT_MS={}", config.control.response_timeout_ms);
    println!("cargo:rustc-env=CONTROL_STATUS_INTERVAL_MS={}", config.control.status_interval_ms);
    println!("cargo:rustc-env=CONTROL_PASSBAND={}", config.control.passband);

    // 音频配置
    println!("cargo:rustc-env=AUDIO_ENABLED={}", config.audio.enabled);
    println!("cargo:rustc-env=AUDIO_CAPTURE_DEVICE={}", config.audio.capture_device);
    println!("cargo:rustc-env=AUDIO_PLAYBACK_DEVICE={}", config.audio.playback_device);
    println!("cargo:rustc-env=AUDIO_SAMPLE_RATE={}", config.audio.sample_rate);
    println!("cargo:rustc-env=AUDIO_CHANNELS={}", config.audio.channels);
    println!("cargo:rustc-env=AUDIO_BLOCK_SIZE={}", config.audio.block_size);
    println!("cargo:rustc-env=AUDIO_TX_FORMAT={}", config.audio.tx_format);
}
