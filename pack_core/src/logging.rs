use std::fmt;
use std::sync::OnceLock;

use parking_lot::RwLock;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
        }
    }
}

/// Pipeline phase a message belongs to; becomes the `log` target suffix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Discover,
    Index,
    Parse,
    Shaders,
    Plan,
    Write,
}

impl Stage {
    pub fn target(self) -> &'static str {
        match self {
            Stage::Discover => "mappack::discover",
            Stage::Index => "mappack::index",
            Stage::Parse => "mappack::parse",
            Stage::Shaders => "mappack::shaders",
            Stage::Plan => "mappack::plan",
            Stage::Write => "mappack::write",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = self.target();
        f.write_str(target.rsplit("::").next().unwrap_or(target))
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Record<'a> {
    pub level: LogLevel,
    pub stage: Stage,
    pub message: &'a str,
}

type Sink = Box<dyn Fn(&Record<'_>) + Send + Sync + 'static>;

fn forward_to_log(record: &Record<'_>) {
    log::log!(target: record.stage.target(), record.level.into(), "{}", record.message);
}

fn sink_cell() -> &'static RwLock<Sink> {
    static SINK: OnceLock<RwLock<Sink>> = OnceLock::new();
    SINK.get_or_init(|| RwLock::new(Box::new(forward_to_log)))
}

/// Replaces the sink every record goes through. The default forwards to the
/// `log` facade under `mappack::<stage>` targets.
pub fn set_sink(sink: impl Fn(&Record<'_>) + Send + Sync + 'static) {
    *sink_cell().write() = Box::new(sink);
}

pub fn reset_sink() {
    *sink_cell().write() = Box::new(forward_to_log);
}

pub fn emit(level: LogLevel, stage: Stage, message: impl AsRef<str>) {
    let sink = sink_cell().read();
    (sink)(&Record {
        level,
        stage,
        message: message.as_ref(),
    });
}

pub fn error(stage: Stage, message: impl AsRef<str>) {
    emit(LogLevel::Error, stage, message);
}

pub fn warn(stage: Stage, message: impl AsRef<str>) {
    emit(LogLevel::Warn, stage, message);
}

pub fn info(stage: Stage, message: impl AsRef<str>) {
    emit(LogLevel::Info, stage, message);
}

pub fn debug(stage: Stage, message: impl AsRef<str>) {
    emit(LogLevel::Debug, stage, message);
}
