//! Logging bootstrap driven by `SOL_LOG_*` environment variables.
//!
//! Recognized keys: `SOL_LOG_LEVEL` (name or number), `SOL_LOG_LEVELS`
//! (`dom:level,dom:level` pairs), `SOL_LOG_ABORT` (abort the process on a
//! record at or above the level), `SOL_LOG_SHOW_{FILE,FUNCTION,LINE,COLORS}`
//! and `SOL_LOG_PRINT_FUNCTION` (`stderr`, `syslog`, `journal`; only
//! `stderr` is wired, the others fall back with a warning). When the
//! process is PID 1 the same keys are also read from `/proc/cmdline`, with
//! the environment taking precedence.

use std::collections::HashMap;
use std::sync::OnceLock;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

fn parse_level(s: &str) -> Option<LevelFilter> {
    match s.trim().to_ascii_uppercase().as_str() {
        "CRI" | "CRIT" | "CRITICAL" | "0" => Some(LevelFilter::ERROR),
        "ERR" | "ERROR" | "1" => Some(LevelFilter::ERROR),
        "WARN" | "WARNING" | "2" => Some(LevelFilter::WARN),
        "INF" | "INFO" | "3" => Some(LevelFilter::INFO),
        "DBG" | "DEBUG" | "4" => Some(LevelFilter::DEBUG),
        "5" => Some(LevelFilter::TRACE),
        _ => None,
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// `SOL_LOG_<KEY>=<VALUE>` entries from the kernel command line, read only
/// when running as init.
fn kcmdline_settings() -> HashMap<String, String> {
    let mut settings = HashMap::new();
    let is_init = rustix::process::getpid().as_raw_nonzero().get() == 1;
    if !is_init {
        return settings;
    }
    let Ok(cmdline) = std::fs::read_to_string("/proc/cmdline") else {
        return settings;
    };
    for entry in cmdline.split_whitespace() {
        let Some(rest) = entry.strip_prefix("SOL_LOG_") else {
            continue;
        };
        if let Some((key, value)) = rest.split_once('=') {
            settings.insert(format!("SOL_LOG_{key}"), value.to_string());
        }
    }
    settings
}

struct Settings {
    kcmdline: HashMap<String, String>,
}

impl Settings {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().or_else(|| self.kcmdline.get(key).cloned())
    }
}

struct AbortLayer {
    level: tracing::Level,
}

impl<S: tracing::Subscriber> Layer<S> for AbortLayer {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        // tracing orders ERROR below WARN
        if *event.metadata().level() <= self.level {
            eprintln!(
                "aborting: {} record from {} (SOL_LOG_ABORT)",
                event.metadata().level(),
                event.metadata().target()
            );
            std::process::abort();
        }
    }
}

static INIT: OnceLock<()> = OnceLock::new();

/// Install the global subscriber. Idempotent; later calls are no-ops, as is
/// running under a test harness that installed its own subscriber.
pub fn init() {
    INIT.get_or_init(|| {
        let settings = Settings {
            kcmdline: kcmdline_settings(),
        };

        let base = settings
            .get("SOL_LOG_LEVEL")
            .as_deref()
            .and_then(parse_level)
            .unwrap_or(LevelFilter::WARN);
        let mut directives = base.to_string();
        if let Some(domains) = settings.get("SOL_LOG_LEVELS") {
            for pair in domains.split(',') {
                let Some((domain, level)) = pair.split_once(':') else {
                    continue;
                };
                if let Some(level) = parse_level(level) {
                    directives.push_str(&format!(",{}={}", domain.trim(), level));
                }
            }
        }
        let filter = EnvFilter::new(directives);

        let show = |key, default| {
            settings
                .get(key)
                .as_deref()
                .and_then(parse_bool)
                .unwrap_or(default)
        };
        let show_file = show("SOL_LOG_SHOW_FILE", true);
        let show_line = show("SOL_LOG_SHOW_LINE", true);
        let show_function = show("SOL_LOG_SHOW_FUNCTION", true);
        let show_colors = show("SOL_LOG_SHOW_COLORS", false);

        if let Some(sink) = settings.get("SOL_LOG_PRINT_FUNCTION") {
            match sink.as_str() {
                "stderr" => {}
                "syslog" | "journal" => {
                    eprintln!("SOL_LOG_PRINT_FUNCTION={sink} not wired, using stderr");
                }
                other => {
                    eprintln!("unsupported SOL_LOG_PRINT_FUNCTION={other}, using stderr");
                }
            }
        }

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(show_colors)
            .with_file(show_file)
            .with_line_number(show_line)
            .with_target(show_function);

        let abort_layer = settings
            .get("SOL_LOG_ABORT")
            .as_deref()
            .and_then(parse_level)
            .and_then(|f| f.into_level())
            .map(|level| AbortLayer { level });

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .with(abort_layer)
            .try_init();
    });
}
