mod audio;
mod config;
mod device_link;
mod frame_codec;
mod gateway;
mod protocol;
mod radio_state;
mod registry;
mod scheduler;
#[cfg(test)]
mod test_utils;

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal;

use audio::{AudioConfig, AudioSystem};
use config::Config;
use device_link::DeviceLink;
use device_link::control::RigctlTransport;
use gateway::RelayGateway;
use registry::{Broadcaster, ClientRegistry};
use scheduler::{CommandScheduler, spawn_status_poller};

// 音频设备打不开时中继照常运行，只是没有音频
#[cfg(feature = "hardware")]
fn start_audio(config: &AudioConfig, broadcaster: Arc<dyn Broadcaster>) -> Option<AudioSystem> {
    if !config.enabled {
        log::info!("Audio disabled in config");
        return None;
    }
    match AudioSystem::start(config.clone(), audio::hardware_backend(), broadcaster) {
        Ok(system) => Some(system),
        Err(e) => {
            log::error!("Audio unavailable, continuing without it: {:#}", e);
            None
        }
    }
}

#[cfg(not(feature = "hardware"))]
fn start_audio(config: &AudioConfig, _broadcaster: Arc<dyn Broadcaster>) -> Option<AudioSystem> {
    if config.enabled {
        log::warn!("Audio requested but this build has no `hardware` feature; running without audio");
    }
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置
    let config = Config::new().map_err(anyhow::Error::msg)?;
    log::info!("{} v{} starting", env!("APP_NAME"), env!("APP_VERSION"));

    // 客户端注册表，同时也是设备事件的广播出口
    let registry = ClientRegistry::new(config.registry.clone());
    let broadcaster: Arc<dyn Broadcaster> = registry.clone();

    // 设备链路：电表遥测 + 音频
    let audio = start_audio(&config.audio, broadcaster.clone());
    let (device_link, device) = DeviceLink::new(config.telemetry.clone(), broadcaster.clone(), audio);
    let device_task = tokio::spawn(device_link.run());

    // rigctld 命令调度，单工作者串行执行
    let transport = RigctlTransport::new(config.control.clone());
    let (scheduler, scheduler_handle) = CommandScheduler::new(config.scheduler.clone(), transport, broadcaster);
    let scheduler_task = tokio::spawn(scheduler.run());
    let poller = spawn_status_poller(scheduler_handle.clone(), config.scheduler.status_interval);

    // 中继服务
    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("Failed to bind relay on {}", config.bind))?;
    let gateway = RelayGateway::new(registry.clone(), scheduler_handle, device, config.audio.clone());

    tokio::select! {
        result = gateway.serve(listener) => result?,
        _ = signal::ctrl_c() => log::info!("Ctrl+C received, shutting down"),
    }

    registry.clear();
    poller.abort();
    scheduler_task.abort();
    device_task.abort();
    // 等设备任务真正结束，确保采集线程已停止
    let _ = device_task.await;

    log::info!("Relay stopped");
    Ok(())
}
