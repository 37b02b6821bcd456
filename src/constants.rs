pub mod network {
    pub const TIMEOUT_API_REQUEST_MS: u64 = 30_000;
    pub const TIMEOUT_ORACLE_MS: u64 = 60_000;
    pub const USER_AGENT: &str = "apiforge/0.1";
    pub const MAX_REDIRECTS: usize = 10;
}

pub mod retry {
    pub const MAX_ATTEMPTS: usize = 3;
    pub const BASE_DELAY_MS: u64 = 250;
    pub const MAX_DELAY_MS: u64 = 5_000;
    pub const JITTER: f64 = 0.0;
    pub const MAX_RETRY_AFTER_MS: u64 = 60_000;
}

pub mod planning {
    pub const MAX_REPLANS: usize = 3;
    pub const MAX_PLANNER_RETRIES: usize = 2;
    pub const MAX_CREDENTIAL_PROMPTS: usize = 3;
    pub const MAX_TRACE_ATTEMPTS: usize = 9;
    pub const ORACLE_URL: &str = "https://api.openai.com/v1/chat/completions";
    pub const ORACLE_MODEL: &str = "gpt-4o-mini";
    pub const ORACLE_TEMPERATURE: f64 = 0.7;
}

pub mod limits {
    pub const MAX_BODY_CAPTURE_BYTES: usize = 64 * 1024;
    pub const DIAGNOSTIC_BODY_CHARS: usize = 1_000;
    pub const LOG_STRING_LENGTH: usize = 2_000;
    pub const MIN_SECRET_LENGTH: usize = 8;
    pub const MIN_API_KEY_LENGTH: usize = 20;
}

pub mod protocols {
    pub const ALLOWED_HTTP: &[&str] = &["http:", "https:"];
}

pub mod crypto {
    pub const KEY_SIZE: usize = 32;
    pub const IV_SIZE: usize = 12;
    pub const TAG_SIZE: usize = 16;
}

pub mod vault {
    pub const KEY_PREFIX: &str = "apiforge";
    pub const REDACTED: &str = "***";
    pub const FILE_MODE: u32 = 0o600;
}
