/// Upstream statuses worth another attempt.
pub const RETRYABLE_STATUS_CODES: &[u16] = &[429, 500, 502, 503, 504, 520];

/// Database defaults
pub const DB_BUSY_TIMEOUT_MS: u32 = 5000;

/// Auth defaults
pub const JWT_SECRET_ENV: &str = "LUMEN_JWT_SECRET";
pub const MIN_PASSWORD_LEN: usize = 8;
pub const MAX_PASSWORD_LEN: usize = 256;
pub const PASSWORD_RESET_TTL_SECS: i64 = 60 * 60;
pub const LOGIN_MAX_FAILURES: u32 = 5;
pub const LOGIN_FAILURE_WINDOW_SECS: u64 = 15 * 60;
pub const RESET_REQUESTED_MESSAGE: &str =
    "If an account exists for that email, a password reset link has been sent.";

/// Chat relay limits
pub const MAX_CHAT_MESSAGES: usize = 200;
pub const MAX_STREAM_LINES: usize = 100_000;
pub const MAX_STREAM_LINE_BYTES: usize = 1024 * 1024;
pub const STREAM_CHANNEL_CAPACITY: usize = 100;
pub const SSE_KEEPALIVE_SECS: u64 = 15;

/// Command block delimiters
pub const COMMAND_OPEN_TAG: &str = "<commands>";
pub const COMMAND_CLOSE_TAG: &str = "</commands>";
pub const COMMAND_OPEN_FENCE: &str = "```commands";
pub const COMMAND_CLOSE_FENCE: &str = "```";

/// History
pub const HISTORY_TITLE_MAX_CHARS: usize = 50;
pub const HISTORY_DEFAULT_TITLE: &str = "New conversation";
pub const HISTORY_ID_MAX_LEN: usize = 64;

/// Storage
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
pub const STORAGE_NAME_MAX_CHARS: usize = 255;
