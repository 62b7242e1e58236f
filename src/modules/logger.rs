use tracing_subscriber::{fmt, EnvFilter};

/// 初始化全局日志。RUST_LOG 可覆盖默认等级。
pub fn init_logger() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kiro_proxy=info"));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
