use std::thread;
use std::time::SystemTime;

use log::{Level, LevelFilter, SetLoggerError};
use nu_ansi_term::ansi::RESET;
use nu_ansi_term::{Color, Style};

pub struct Logger {
	level: LevelFilter,
}

impl Logger {
	/// Install the logger as the process-wide `log` sink.
	pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
		log::set_boxed_logger(Box::new(Self { level }))?;
		log::set_max_level(level);
		Ok(())
	}
}

impl log::Log for Logger {
	fn enabled(&self, metadata: &log::Metadata) -> bool {
		metadata.level() <= self.level
	}

	fn log(&self, record: &log::Record) {
		if !self.enabled(record.metadata()) {
			return;
		}

		let time = humantime::format_rfc3339_nanos(SystemTime::now());

		let dim = Style::new().dimmed().prefix();

		let current = thread::current();
		let thread = current.name().unwrap_or("-");

		eprintln!(
			"{dim}{time} {thread}{RESET} {}{:5}{RESET} {}{}{RESET}{dim}:{RESET} {}",
			match record.level() {
				Level::Trace => Color::Purple,
				Level::Debug => Color::Blue,
				Level::Info => Color::Green,
				Level::Warn => Color::Yellow,
				Level::Error => Color::Red,
			}
			.bold()
			.prefix(),
			record.level(),
			Style::new().bold().prefix(),
			record.target(),
			record.args()
		);
	}

	fn flush(&self) {}
}
