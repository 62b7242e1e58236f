mod auth;
mod error;
mod models;
mod modules;
mod proxy;

use tracing::{error, info};

use proxy::config::ProxyConfig;

#[cfg(target_os = "macos")]
fn increase_nofile_limit() {
    unsafe {
        let mut rl = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut rl) == 0 {
            let target = 4096.min(rl.rlim_max);
            if rl.rlim_cur < target {
                rl.rlim_cur = target;
                if libc::setrlimit(libc::RLIMIT_NOFILE, &rl) != 0 {
                    tracing::warn!("Failed to increase file descriptor limit");
                }
            }
        }
    }
}

#[tokio::main]
async fn main() {
    modules::logger::init_logger();

    #[cfg(target_os = "macos")]
    increase_nofile_limit();

    // 唯一的 CLI 参数：可选端口号
    let cli_port = match std::env::args().nth(1) {
        Some(arg) => match arg.parse::<u16>() {
            Ok(port) => Some(port),
            Err(_) => {
                error!("invalid port argument: {}", arg);
                std::process::exit(2);
            }
        },
        None => None,
    };

    let config = ProxyConfig::from_env(cli_port);
    info!("--------------------------------------------------");
    info!("kiro-proxy starting");
    info!("Port: {}", config.port);
    info!("Upstream: {}", config.base_url);
    info!("--------------------------------------------------");

    if let Err(e) = proxy::server::run(config).await {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
