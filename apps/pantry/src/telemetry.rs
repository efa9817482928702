pub mod logging {
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;

    use clap::ValueEnum;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    /// Full filter override, e.g. `pantry_chat_core::transport=trace,warn`.
    pub const FILTER_ENV: &str = "PANTRY_LOG_FILTER";
    /// Set to keep HTTP and WebSocket internals at the requested verbosity.
    pub const TRACE_DEPS_ENV: &str = "PANTRY_TRACE_DEPS";

    const OWN_CRATES: &[&str] = &["pantry", "pantry_chat_core", "pantry_protocol"];
    const NOISY_DEPENDENCIES: &[&str] = &[
        "tungstenite",
        "tokio_tungstenite",
        "hyper",
        "hyper_util",
        "h2",
        "reqwest",
        "rustls",
        "native_tls",
        "mio",
    ];

    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl From<LogLevel> for LevelFilter {
        fn from(level: LogLevel) -> Self {
            match level {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        /// Logs go to stderr when unset; stdout belongs to the transcript.
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("cannot open log file {path:?}: {source}")]
        OpenFile {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("global subscriber already installed: {0}")]
        Install(#[from] tracing_subscriber::util::TryInitError),
    }

    static WRITER_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber once; repeat calls return `Ok(())`.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if WRITER_GUARD.get().is_some() {
            return Ok(());
        }

        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::OpenFile {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let (directives, throttled) = match std::env::var(FILTER_ENV) {
            Ok(custom) if !custom.trim().is_empty() => (custom, false),
            _ => directives_for(config.level.into(), super::env_flag(TRACE_DEPS_ENV)),
        };
        let verbose = config.level >= LogLevel::Debug;

        tracing_subscriber::registry()
            .with(EnvFilter::new(directives))
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(config.file.is_none())
                    .with_target(verbose)
                    .with_thread_ids(config.level == LogLevel::Trace),
            )
            .try_init()?;

        let _ = WRITER_GUARD.set(guard);
        if throttled {
            tracing::debug!(
                target: "pantry::telemetry",
                "dependency logs capped at info; set {TRACE_DEPS_ENV}=1 to lift"
            );
        }
        Ok(())
    }

    /// Filter directives for `level`. Verbose levels apply only to this
    /// workspace's crates, and dependencies stay at `info` unless
    /// `allow_deps` is set. The flag reports whether that cap was applied.
    pub(crate) fn directives_for(level: LevelFilter, allow_deps: bool) -> (String, bool) {
        if level < LevelFilter::DEBUG {
            return (level.to_string().to_lowercase(), false);
        }
        let own = level.to_string().to_lowercase();
        let mut directives = vec!["info".to_string()];
        directives.extend(OWN_CRATES.iter().map(|krate| format!("{krate}={own}")));
        let throttled = !allow_deps;
        if throttled {
            directives.extend(NOISY_DEPENDENCIES.iter().map(|dep| format!("{dep}=info")));
        }
        (directives.join(","), throttled)
    }

}

fn env_flag(var: &str) -> bool {
    std::env::var(var)
        .map(|value| {
            let value = value.trim();
            !value.is_empty() && value != "0" && !value.eq_ignore_ascii_case("false")
        })
        .unwrap_or(false)
}
