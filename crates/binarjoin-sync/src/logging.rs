use tracing_subscriber::EnvFilter;

/// 安装 fmt 日志订阅者；宿主已安装时忽略
///
/// 过滤规则优先取 `RUST_LOG`，否则调试模式为 `debug`，普通模式为 `info`。
pub fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(debug)
        .try_init();
}
