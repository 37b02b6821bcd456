use crate::constants::limits::LOG_STRING_LENGTH;
use crate::utils::redact::{truncate_for_display, SecretRegistry};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    fn from_env() -> Self {
        match std::env::var("LOG_LEVEL")
            .unwrap_or_else(|_| "info".to_string())
            .to_lowercase()
            .as_str()
        {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            _ => LogLevel::Info,
        }
    }

    fn rank(self) -> u8 {
        match self {
            LogLevel::Error => 0,
            LogLevel::Warn => 1,
            LogLevel::Info => 2,
            LogLevel::Debug => 3,
        }
    }

    fn label(self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    error: u64,
    warn: u64,
    info: u64,
    debug: u64,
}

#[derive(Clone)]
enum Sink {
    Stderr,
    Memory(Arc<Mutex<Vec<String>>>),
}

#[derive(Clone)]
pub struct LogCapture {
    lines: Arc<Mutex<Vec<String>>>,
}

impl LogCapture {
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn joined(&self) -> String {
        self.lines().join("\n")
    }
}

#[derive(Clone)]
pub struct Logger {
    context: String,
    level: LogLevel,
    counters: Arc<Mutex<Counters>>,
    secrets: SecretRegistry,
    sink: Sink,
}

impl Logger {
    pub fn new(context: &str) -> Self {
        Self::with_registry(context, SecretRegistry::new())
    }

    pub fn with_registry(context: &str, secrets: SecretRegistry) -> Self {
        Self {
            context: context.to_string(),
            level: LogLevel::from_env(),
            counters: Arc::new(Mutex::new(Counters::default())),
            secrets,
            sink: Sink::Stderr,
        }
    }

    pub fn capturing(context: &str, secrets: SecretRegistry) -> (Self, LogCapture) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let mut logger = Self::with_registry(context, secrets);
        logger.level = LogLevel::Debug;
        logger.sink = Sink::Memory(lines.clone());
        (logger, LogCapture { lines })
    }

    pub fn child(&self, suffix: &str) -> Self {
        let context = if suffix.is_empty() {
            self.context.clone()
        } else {
            format!("{}:{}", self.context, suffix)
        };
        Self {
            context,
            level: self.level,
            counters: self.counters.clone(),
            secrets: self.secrets.clone(),
            sink: self.sink.clone(),
        }
    }

    pub fn secrets(&self) -> &SecretRegistry {
        &self.secrets
    }

    pub fn set_level(&mut self, level: LogLevel) {
        self.level = level;
    }

    fn log(&self, level: LogLevel, message: &str, meta: Option<&serde_json::Value>) {
        if level.rank() > self.level.rank() {
            return;
        }
        if let Ok(mut counters) = self.counters.lock() {
            match level {
                LogLevel::Error => counters.error += 1,
                LogLevel::Warn => counters.warn += 1,
                LogLevel::Info => counters.info += 1,
                LogLevel::Debug => counters.debug += 1,
            }
        }
        let timestamp = chrono::Utc::now().to_rfc3339();
        let meta_suffix = meta
            .filter(|m| !m.is_null())
            .map(|m| format!(" {}", self.secrets.redact_value(m)))
            .unwrap_or_default();
        let line = format!(
            "[{}] {} [{}] {}{}",
            timestamp,
            level.label(),
            self.context,
            self.secrets.redact(message),
            meta_suffix
        );
        let line = truncate_for_display(&line, LOG_STRING_LENGTH);
        match &self.sink {
            Sink::Stderr => eprintln!("{}", line),
            Sink::Memory(lines) => {
                if let Ok(mut guard) = lines.lock() {
                    guard.push(line);
                }
            }
        }
    }

    pub fn error(&self, message: &str, meta: Option<&serde_json::Value>) {
        self.log(LogLevel::Error, message, meta);
    }

    pub fn warn(&self, message: &str, meta: Option<&serde_json::Value>) {
        self.log(LogLevel::Warn, message, meta);
    }

    pub fn info(&self, message: &str, meta: Option<&serde_json::Value>) {
        self.log(LogLevel::Info, message, meta);
    }

    pub fn debug(&self, message: &str, meta: Option<&serde_json::Value>) {
        self.log(LogLevel::Debug, message, meta);
    }

    pub fn stats(&self) -> serde_json::Value {
        let counters = self.counters.lock().unwrap_or_else(|err| err.into_inner());
        serde_json::json!({
            "level": format!("{:?}", self.level).to_lowercase(),
            "context": self.context,
            "error": counters.error,
            "warn": counters.warn,
            "info": counters.info,
            "debug": counters.debug,
        })
    }
}
