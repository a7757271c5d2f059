//! Tracing (logging)

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::CommandLineArgs;

/// Log level of this crate selected by the verbosity flags.
fn crate_level(args: &CommandLineArgs) -> LevelFilter {
    match (args.quiet, args.verbose) {
        (true, _) => LevelFilter::WARN,
        (false, 0) => LevelFilter::INFO,
        (false, 1) => LevelFilter::DEBUG,
        (false, _) => LevelFilter::TRACE,
    }
}

/// Initlialise tracing (logging)
///
/// Applies a filter based on the `RUST_LOG` environment variable. If not set, this crate logs at
/// the level selected by `--verbose` and `--quiet`. Event targets are shown when verbose.
pub fn init_tracing(args: &CommandLineArgs) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::default().add_directive(
            format!("powder_reduction={}", crate_level(args))
                .parse()
                .unwrap_or_else(|_| LevelFilter::INFO.into()),
        )
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(args.verbose > 0))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn args(flags: &[&str]) -> CommandLineArgs {
        let mut argv = vec!["powder-reduction", "--request", "job.json"];
        argv.extend_from_slice(flags);
        CommandLineArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn crate_level_from_flags() {
        assert_eq!(LevelFilter::INFO, crate_level(&args(&[])));
        assert_eq!(LevelFilter::DEBUG, crate_level(&args(&["-v"])));
        assert_eq!(LevelFilter::TRACE, crate_level(&args(&["-vvv"])));
        assert_eq!(LevelFilter::WARN, crate_level(&args(&["--quiet"])));
    }
}
