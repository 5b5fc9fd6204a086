//! Logging setup for the `walgo` binary.
//!
//! Progress bars and deployment summaries own stdout, so diagnostics go to
//! stderr behind a `WALGO_LOG` filter and stay one line per event. The
//! orchestrator wraps each deployment phase in a span, so logging span
//! closes turns `WALGO_LOG=debug` into a per-phase timing report.

use std::{io::BufWriter, path::Path};

use clap::ValueEnum;
use color_eyre::{Result, eyre::Context as _};
use tracing_error::ErrorLayer;
use tracing_flame::{FlameLayer, FlushGuard};
use tracing_subscriber::{
    EnvFilter, Layer as _,
    fmt::{MakeWriter, format::FmtSpan},
    layer::SubscriberExt as _,
};

/// Environment variable holding the log filter directive.
const LOG_ENV: &str = "WALGO_LOG";

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum WhenColor {
    Always,
    Never,
    Auto,
}

impl WhenColor {
    /// The ANSI override for stderr. `None` leaves terminal detection in
    /// charge.
    fn ansi(self) -> Option<bool> {
        match self {
            WhenColor::Always => Some(true),
            WhenColor::Never => Some(false),
            WhenColor::Auto => None,
        }
    }
}

type FlameFlushGuard = FlushGuard<BufWriter<std::fs::File>>;

pub fn make_logger<W>(
    writer: W,
    profile: Option<impl AsRef<Path>>,
    color: WhenColor,
) -> Result<(impl tracing::Subscriber, Option<FlameFlushGuard>)>
where
    W: for<'writer> MakeWriter<'writer> + 'static,
{
    // Profiling is opt-in via the hidden --profile flag. The guard must
    // outlive the run or the flamegraph file ends up truncated.
    let (flame_layer, flame_guard) = match profile {
        Some(profile) => {
            let profile = profile.as_ref();
            let (layer, guard) = FlameLayer::with_file(profile)
                .with_context(|| format!("set up profiling to {profile:?}"))?;
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let filter = EnvFilter::builder()
        .with_env_var(LOG_ENV)
        .from_env_lossy();

    // Compact events with the callsite attached. A deployment is a linear
    // sequence of phases, so thread ids and span-entry events would only add
    // noise; the close event per span carries the timing that matters.
    let mut fmt = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(writer);
    if let Some(ansi) = color.ansi() {
        fmt = fmt.with_ansi(ansi);
    }

    let logger = tracing_subscriber::registry()
        .with(ErrorLayer::default())
        .with(fmt.with_filter(filter))
        .with(flame_layer);

    Ok((logger, flame_guard))
}
