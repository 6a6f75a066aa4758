use log::LevelFilter;
use once_cell::sync::OnceCell;

static LOG_LEVEL: OnceCell<LevelFilter> = OnceCell::new();

fn env_level() -> LevelFilter {
    std::env::var("LIDAR_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(|v| parse_level(Some(v)))
        .unwrap_or(LevelFilter::Info)
}

fn parse_level(input: Option<&str>) -> Option<LevelFilter> {
    input.and_then(|s| s.trim().parse::<LevelFilter>().ok())
}

/// Initialize the stderr logger from `LIDAR_LOG`/`RUST_LOG`, or from `level`
/// when given (e.g. a `--log-level` flag).
///
/// Safe to call multiple times; the first call installs the logger and every
/// call returns the level that was installed.
pub fn init_logging(level: Option<&str>) -> LevelFilter {
    *LOG_LEVEL.get_or_init(|| {
        let level = parse_level(level).unwrap_or_else(env_level);
        let installed = env_logger::Builder::new()
            .filter_level(level)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .try_init();
        if installed.is_err() {
            log::debug!("logger already installed by the host, keeping it");
        }
        level
    })
}
