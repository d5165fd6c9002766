use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use yunpan_server::{app::AppContext, config::AppConfig, logging};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = AppConfig::load(&config_path)?;
    let _log_guard = logging::init(&config.log)?;

    let ctx = Arc::new(AppContext::build(config)?);
    // 自动生成的站点标识写回配置文件，重启后保持不变
    ctx.config.save(&config_path)?;

    ctx.start().await?;
    info!(
        pending_downloads = ctx.pending_download_count(),
        "服务已启动，Ctrl-C 退出"
    );

    tokio::signal::ctrl_c().await?;
    info!("收到退出信号，正在关闭");
    Ok(())
}
