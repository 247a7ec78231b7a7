//! Tracing setup for hosts embedding a session.

use std::fs::OpenOptions;
use std::path::PathBuf;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;

/// Filter directives, in `RUST_LOG` syntax.
pub const LOG_ENV: &str = "KILN_LOG";

/// Directory that receives a per-process log file instead of stderr.
pub const LOG_DIR_ENV: &str = "KILN_LOG_DIR";

fn filter(verbose: bool) -> EnvFilter {
	EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| {
		if verbose {
			EnvFilter::new("kiln_deps=trace,kiln_loader=trace,kiln_session=trace,debug")
		} else {
			EnvFilter::new("kiln_deps=debug,kiln_loader=debug,kiln_session=debug,info")
		}
	})
}

/// Installs a global subscriber. Does nothing if one is already installed.
pub fn init_tracing(verbose: bool) {
	if let Some(log_dir) = std::env::var_os(LOG_DIR_ENV).map(PathBuf::from)
		&& std::fs::create_dir_all(&log_dir).is_ok()
	{
		let log_path = log_dir.join(format!("kiln.{}.log", std::process::id()));

		if let Ok(file) = OpenOptions::new().create(true).append(true).open(&log_path) {
			let file_layer = tracing_subscriber::fmt::layer()
				.with_writer(file)
				.with_ansi(false)
				.with_span_events(FmtSpan::CLOSE)
				.with_target(true);

			if tracing_subscriber::registry()
				.with(filter(verbose))
				.with(file_layer)
				.try_init()
				.is_ok()
			{
				tracing::info!(path = ?log_path, "Kiln tracing initialized");
			}
			return;
		}
	}

	let _ = tracing_subscriber::fmt()
		.with_env_filter(filter(verbose))
		.with_writer(std::io::stderr)
		.try_init();
}
