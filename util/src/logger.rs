// Copyright 2024 The GridLink Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! log4rs-backed logging for the workspace. The configuration maps onto a
//! small table of sinks (console, file); each sink becomes one appender
//! with its own threshold. A broken file sink downgrades to whatever else
//! is configured instead of failing the embedding application.

use std::{panic, thread};

use backtrace::Backtrace;
use log::{LevelFilter, Record};
use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::append::rolling_file::{
	policy::compound::roll::fixed_window::FixedWindowRoller,
	policy::compound::trigger::size::SizeTrigger, policy::compound::CompoundPolicy,
	RollingFileAppender,
};
use log4rs::append::Append;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use log4rs::filter::{threshold::ThresholdFilter, Filter, Response};

use crate::types::{LogLevel, LoggingConfig};
use crate::Mutex;

const LOG_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S%.3f)} {h({l})} {M} - {m}{n}";

const ROTATED_FILES_DEFAULT: u32 = 32;

lazy_static! {
	// log4rs refuses a second install; remember ours
	static ref INITIALIZED: Mutex<bool> = Mutex::new(false);
}

fn threshold(level: &LogLevel) -> LevelFilter {
	match level {
		LogLevel::Error => LevelFilter::Error,
		LogLevel::Warning => LevelFilter::Warn,
		LogLevel::Info => LevelFilter::Info,
		LogLevel::Debug => LevelFilter::Debug,
		LogLevel::Trace => LevelFilter::Trace,
	}
}

/// Keeps the log dedicated to grid client records by rejecting every
/// record originating outside the workspace crates.
#[derive(Debug)]
struct CrateFilter;

impl Filter for CrateFilter {
	fn filter(&self, record: &Record<'_>) -> Response {
		match record.module_path() {
			Some(path) if path.starts_with("gridlink") => Response::Neutral,
			_ => Response::Reject,
		}
	}
}

// One destination for log records: a named appender and its threshold.
struct Sink {
	name: &'static str,
	level: LevelFilter,
	appender: Box<dyn Append>,
}

fn console_sink(config: &LoggingConfig) -> Option<Sink> {
	if !config.log_to_stdout {
		return None;
	}
	let appender = ConsoleAppender::builder()
		.encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
		.build();
	Some(Sink {
		name: "stdout",
		level: threshold(&config.stdout_log_level),
		appender: Box::new(appender),
	})
}

fn file_sink(config: &LoggingConfig) -> Option<Sink> {
	if !config.log_to_file {
		return None;
	}
	let appender = match build_file_appender(config) {
		Ok(appender) => appender,
		Err(e) => {
			eprintln!(
				"not logging to \"{}\": {}",
				config.log_file_path, e
			);
			return None;
		}
	};
	Some(Sink {
		name: "file",
		level: threshold(&config.file_log_level),
		appender,
	})
}

// A size bound turns the plain file appender into a rolling one.
fn build_file_appender(config: &LoggingConfig) -> Result<Box<dyn Append>, String> {
	let encoder = Box::new(PatternEncoder::new(LOG_PATTERN));
	match config.log_max_size {
		Some(size) => {
			let roller = FixedWindowRoller::builder()
				.build(
					&format!("{}.{{}}", config.log_file_path),
					config.log_max_files.unwrap_or(ROTATED_FILES_DEFAULT),
				)
				.map_err(|e| e.to_string())?;
			let policy = CompoundPolicy::new(Box::new(SizeTrigger::new(size)), Box::new(roller));
			let appender = RollingFileAppender::builder()
				.append(config.log_file_append)
				.encoder(encoder)
				.build(&config.log_file_path, Box::new(policy))
				.map_err(|e| e.to_string())?;
			Ok(Box::new(appender))
		}
		None => {
			let appender = FileAppender::builder()
				.append(config.log_file_append)
				.encoder(encoder)
				.build(&config.log_file_path)
				.map_err(|e| e.to_string())?;
			Ok(Box::new(appender))
		}
	}
}

// Wires the sinks into a log4rs config and installs it. The root level is
// the most verbose threshold across sinks; per-sink thresholds and the
// crate filter do the rest.
fn install(sinks: Vec<Sink>) {
	if sinks.is_empty() {
		return;
	}

	let mut minimum = LevelFilter::Off;
	let mut names = vec![];
	let mut root = Root::builder();
	let mut builder = Config::builder();
	for sink in sinks {
		minimum = minimum.max(sink.level);
		names.push(sink.name);
		builder = builder.appender(
			Appender::builder()
				.filter(Box::new(ThresholdFilter::new(sink.level)))
				.filter(Box::new(CrateFilter))
				.build(sink.name, sink.appender),
		);
		root = root.appender(sink.name);
	}

	let config = match builder.build(root.build(minimum)) {
		Ok(config) => config,
		Err(e) => {
			eprintln!("logging disabled, invalid log configuration: {}", e);
			return;
		}
	};
	if log4rs::init_config(config).is_ok() {
		debug!("log sinks installed: {}", names.join(", "));
	}
}

/// Installs the global logger per the provided configuration and hooks
/// panics into it. With `None` only the panic hook is installed.
pub fn init_logger(config: Option<LoggingConfig>) {
	if let Some(config) = config {
		let mut initialized = INITIALIZED.lock();
		if !*initialized {
			let sinks = vec![console_sink(&config), file_sink(&config)];
			install(sinks.into_iter().flatten().collect());
			*initialized = true;
		}
	}
	hook_panics();
}

/// Console-only logging at debug level for unit and integration tests.
/// Safe to call from every test; only the first call installs anything.
pub fn init_test_logger() {
	let mut initialized = INITIALIZED.lock();
	if *initialized {
		return;
	}

	let mut config = LoggingConfig::default();
	config.log_to_file = false;
	config.stdout_log_level = LogLevel::Debug;
	install(console_sink(&config).into_iter().collect());
	*initialized = true;
}

/// Routes panics through the log (and stderr, in case the logger itself
/// is the casualty), with a backtrace and the panicking thread's name.
fn hook_panics() {
	panic::set_hook(Box::new(|info| {
		let payload = info.payload();
		let message = if let Some(s) = payload.downcast_ref::<&str>() {
			(*s).to_string()
		} else if let Some(s) = payload.downcast_ref::<String>() {
			s.clone()
		} else {
			"panic".to_string()
		};
		let location = info
			.location()
			.map(|l| format!("{}:{}", l.file(), l.line()))
			.unwrap_or_else(|| "unknown location".to_string());

		let thread = thread::current();
		let name = thread.name().unwrap_or("unnamed");

		error!(
			"thread '{}' panicked at {}: {}\n{:?}",
			name,
			location,
			message,
			Backtrace::new()
		);
		eprintln!("thread '{}' panicked at {}: {}", name, location, message);
	}));
}
