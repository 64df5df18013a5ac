use std::{path::PathBuf, process::ExitStatus};

use thiserror::Error;

use crate::server::ServerState;

/// Failures while bringing a server up.
///
/// None of these are handed back to the test: [`Server::new_started`] routes them to a
/// [`FailureReporter`]. Early exits are retried a few times before they become
/// [`Error::KeepsExiting`].
///
/// [`Server::new_started`]: crate::Server::new_started
/// [`FailureReporter`]: crate::FailureReporter
#[derive(Debug, Error)]
pub enum Error {
	#[error("failed to reserve a free port: {0}")]
	PortAllocation(#[source] std::io::Error),
	#[error("no free port found after {attempts} attempts")]
	PortsExhausted { attempts: usize },
	#[error("failed to spawn <binary='{}'>: {source}", .binary.display())]
	Spawn {
		binary: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error(transparent)]
	PidFile(#[from] FileIOError),
	#[error("server diagnostic stream was not captured")]
	MissingDiagnosticStream,
	#[error("server exited before becoming ready{}", describe_exit(.status, .stderr_tail))]
	ExitedBeforeReady {
		status: Option<ExitStatus>,
		stderr_tail: Vec<String>,
	},
	#[error(
		"server exited before becoming ready {attempts} times in a row{}",
		describe_exit(.status, .stderr_tail)
	)]
	KeepsExiting {
		attempts: u32,
		status: Option<ExitStatus>,
		stderr_tail: Vec<String>,
	},
	#[error("server did not become ready after {attempts} attempts")]
	AttemptsExhausted { attempts: u32 },
	#[error("server is not ready <state={state:?}>")]
	NotReady { state: ServerState },
}

fn describe_exit(status: &Option<ExitStatus>, stderr_tail: &[String]) -> String {
	let mut description = status.map(|s| format!(" ({s})")).unwrap_or_default();

	if !stderr_tail.is_empty() {
		description.push_str("; last output: ");
		description.push_str(&stderr_tail.join(" | "));
	}

	description
}

/// Filesystem failure, with what we were doing and the path it happened on.
#[derive(Debug, Error)]
#[error("{context} <path='{}'>: {source}", .path.display())]
pub struct FileIOError {
	pub path: PathBuf,
	pub context: &'static str,
	#[source]
	pub source: std::io::Error,
}

impl FileIOError {
	pub fn new(path: impl Into<PathBuf>, context: &'static str, source: std::io::Error) -> Self {
		Self {
			path: path.into(),
			context,
			source,
		}
	}
}
