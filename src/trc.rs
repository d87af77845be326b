//! Logging setup for the `blob-fs` binary.

use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt as _,
    util::{SubscriberInitExt as _, TryInitError},
};

/// Filter variable checked before `RUST_LOG`.
const LOG_ENV: &str = "BLOB_FS_LOG";

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Output {
    /// Compact lines on stderr, interleaved with progress spinners.
    Interactive,
    /// Every event plus span enter and close.
    Verbose,
    /// Plain lines without colors for a process detached from its terminal.
    Detached,
}

pub struct Trc {
    output: Output,
    filter: EnvFilter,
}

impl Trc {
    /// Choose the output from the environment. An explicit filter selects verbose output,
    /// otherwise the interactive output runs at `info`.
    pub fn from_env() -> Self {
        match EnvFilter::try_from_env(LOG_ENV).or_else(|_| EnvFilter::try_from_default_env()) {
            Ok(filter) => Self {
                output: Output::Verbose,
                filter,
            },
            Err(_) => Self {
                output: Output::Interactive,
                filter: EnvFilter::new("info"),
            },
        }
    }

    /// Log for a daemonized process, keeping the chosen filter.
    #[must_use]
    pub fn detached(mut self) -> Self {
        self.output = Output::Detached;
        self
    }

    pub fn init(self) -> Result<(), TryInitError> {
        let registry = tracing_subscriber::registry().with(self.filter);
        match self.output {
            Output::Verbose => registry
                .with(fmt::layer().with_span_events(FmtSpan::ENTER | FmtSpan::CLOSE))
                .try_init(),
            Output::Detached => registry.with(fmt::layer().with_ansi(false)).try_init(),
            Output::Interactive => {
                let spinners = IndicatifLayer::new();
                registry
                    .with(
                        fmt::layer()
                            .with_writer(spinners.get_stderr_writer())
                            .with_target(false)
                            .without_time()
                            .compact(),
                    )
                    .with(spinners)
                    .try_init()
            }
        }
    }
}
