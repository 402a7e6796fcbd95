use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Book library server with accounts, reading progress and analytics.
#[derive(Parser, Debug, Clone)]
#[command(name = "bookshelf-rs")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file.
    #[arg(short, long, env = "BOOKSHELF_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the server (default if no command given).
    Serve {
        /// Address to bind the server to.
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },

    /// User management commands.
    User {
        /// User subcommand action.
        #[command(subcommand)]
        action: UserCommand,
    },

    /// Audit log commands.
    Audit {
        /// Audit subcommand action.
        #[command(subcommand)]
        action: AuditCommand,
    },

    /// Import every markdown/text file under a directory as a book.
    Import {
        /// Directory to walk.
        dir: PathBuf,
        /// Category assigned to imported books.
        #[arg(long)]
        category: Option<String>,
    },

    /// Initialize database and create default config.
    Init {
        /// Force overwrite existing config.
        #[arg(short, long)]
        force: bool,
    },
}

/// User management subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum UserCommand {
    /// Add a new user.
    Add {
        /// Username.
        username: String,
        /// Password (will prompt if not provided).
        #[arg(short, long)]
        password: Option<String>,
        /// User role (admin, author or user).
        #[arg(short, long, default_value = "user")]
        role: String,
        /// Email address.
        #[arg(short, long)]
        email: Option<String>,
    },

    /// Delete a user.
    Del {
        /// Username to delete.
        username: String,
    },

    /// List all users.
    List,

    /// Change user password.
    Passwd {
        /// Username.
        username: String,
        /// New password (will prompt if not provided).
        #[arg(short, long)]
        password: Option<String>,
    },

    /// Change user role.
    Role {
        /// Username.
        username: String,
        /// New role (admin, author or user).
        role: String,
    },
}

/// Audit log subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum AuditCommand {
    /// Show the most recent entries.
    List {
        /// Number of entries to show.
        #[arg(short, long, default_value = "50")]
        limit: u32,
        /// Only entries with this action.
        #[arg(short, long)]
        action: Option<String>,
    },

    /// Delete entries older than the given number of days.
    Prune {
        /// Age threshold in days.
        #[arg(short, long)]
        days: u32,
    },
}

/// Main configuration from TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Authentication configuration.
    #[serde(default)]
    pub auth: AuthConfig,

    /// HTTP hardening configuration.
    #[serde(default)]
    pub security: SecurityConfig,

    /// E-book and cover storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Analytics configuration.
    #[serde(default)]
    pub analytics: AnalyticsConfig,
}

/// Deployment environment, controls error verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Full error messages in responses.
    #[default]
    Development,
    /// Sanitized 5xx responses.
    Production,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Deployment environment.
    #[serde(default)]
    pub environment: Environment,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            environment: Environment::default(),
        }
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::new(
        std::net::IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0)),
        8080,
    )
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/bookshelf.db")
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret for signing tokens.
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,

    /// Token lifetime in hours.
    #[serde(default = "default_token_hours")]
    pub token_hours: u32,

    /// Registration mode: "open", "disabled".
    #[serde(default = "default_registration")]
    pub registration: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: default_jwt_secret(),
            token_hours: default_token_hours(),
            registration: default_registration(),
        }
    }
}

fn default_jwt_secret() -> String {
    "change-me".to_string()
}

fn default_token_hours() -> u32 {
    24
}

fn default_registration() -> String {
    "open".to_string()
}

impl AuthConfig {
    /// Check if registration is enabled.
    pub fn registration_enabled(&self) -> bool {
        self.registration == "open"
    }
}

/// HTTP hardening configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Allowed CORS origins; `*` allows any.
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,

    /// Sustained requests per second per client IP (0 disables limiting,
    /// at most one per nanosecond).
    #[serde(default = "default_rate_limit_per_second")]
    pub rate_limit_per_second: u64,

    /// Burst size per client IP.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,

    /// Take the client IP from `X-Forwarded-For` / `X-Real-IP`. Enable only
    /// behind a reverse proxy that overwrites these headers.
    #[serde(default)]
    pub trust_proxy: bool,

    /// Maximum JSON body size in bytes.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            cors_origins: default_cors_origins(),
            rate_limit_per_second: default_rate_limit_per_second(),
            rate_limit_burst: default_rate_limit_burst(),
            trust_proxy: false,
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_rate_limit_per_second() -> u64 {
    10
}

fn default_rate_limit_burst() -> u32 {
    50
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

impl SecurityConfig {
    /// Whether any origin is accepted.
    pub fn cors_any(&self) -> bool {
        self.cors_origins.is_empty() || self.cors_origins.iter().any(|o| o == "*")
    }
}

/// Where uploaded e-book content lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// One file per book under `ebooks_dir`.
    #[default]
    Disk,
    /// Inline BLOB in the books table.
    Database,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage mode.
    #[serde(default)]
    pub mode: StorageMode,

    /// Directory for e-book files in disk mode.
    #[serde(default = "default_ebooks_dir")]
    pub ebooks_dir: PathBuf,

    /// Maximum upload size (e-book + cover) in bytes.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,

    /// Longest cover side in pixels after downscaling.
    #[serde(default = "default_cover_max_size")]
    pub cover_max_size: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: StorageMode::default(),
            ebooks_dir: default_ebooks_dir(),
            max_upload_bytes: default_max_upload_bytes(),
            cover_max_size: default_cover_max_size(),
        }
    }
}

fn default_ebooks_dir() -> PathBuf {
    PathBuf::from("data/ebooks")
}

fn default_max_upload_bytes() -> usize {
    50 * 1024 * 1024
}

fn default_cover_max_size() -> u32 {
    600
}

/// Analytics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    /// Days covered by the default daily series.
    #[serde(default = "default_days")]
    pub default_days: u32,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            default_days: default_days(),
        }
    }
}

fn default_days() -> u32 {
    30
}

impl Config {
    /// Load configuration from file.
    pub fn load(path: &PathBuf) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::error::AppError::Config(format!("Failed to read config file: {}", e))
        })?;

        toml::from_str(&content).map_err(|e| {
            crate::error::AppError::Config(format!("Failed to parse config file: {}", e))
        })
    }

    /// Find config file in default locations.
    pub fn find_config_file() -> Option<PathBuf> {
        let candidates = [
            PathBuf::from("config.toml"),
            PathBuf::from("bookshelf.toml"),
            dirs::config_dir()
                .map(|p| p.join("bookshelf-rs").join("config.toml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/bookshelf-rs/config.toml"),
        ];

        candidates.into_iter().find(|p| p.exists())
    }

    /// Generate default config file content with the given token secret.
    pub fn generate_default(jwt_secret: &str) -> String {
        format!(
            r#"# bookshelf-rs configuration

[server]
bind = "0.0.0.0:8080"
# "development" returns full error messages, "production" hides internals
environment = "development"

[database]
# path = "/var/lib/bookshelf-rs/bookshelf.db"

[auth]
jwt_secret = "{jwt_secret}"
# Token lifetime in hours
token_hours = 24
# Registration mode: "open" or "disabled"
registration = "open"

[security]
# Allowed CORS origins, "*" for any
cors_origins = ["*"]
# Requests per second per client IP (0 disables rate limiting)
rate_limit_per_second = 10
rate_limit_burst = 50
# Read client IPs from X-Forwarded-For (only behind a reverse proxy)
trust_proxy = false
max_body_bytes = 1048576

[storage]
# "disk" or "database"
mode = "disk"
# ebooks_dir = "/var/lib/bookshelf-rs/ebooks"
max_upload_bytes = 52428800
cover_max_size = 600

[analytics]
default_days = 30
"#
        )
    }
}

/// Supported e-book formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookFormat {
    /// Markdown.
    Md,
    /// Plain text.
    Txt,
    /// HTML.
    Html,
    /// PDF.
    Pdf,
    /// EPUB.
    Epub,
}

impl BookFormat {
    /// Get the MIME type for this format.
    pub fn mime_type(&self) -> &'static str {
        match self {
            BookFormat::Md => "text/markdown; charset=utf-8",
            BookFormat::Txt => "text/plain; charset=utf-8",
            BookFormat::Html => "text/html; charset=utf-8",
            BookFormat::Pdf => "application/pdf",
            BookFormat::Epub => "application/epub+zip",
        }
    }

    /// Try to detect format from file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "md" | "markdown" => Some(BookFormat::Md),
            "txt" => Some(BookFormat::Txt),
            "html" | "htm" => Some(BookFormat::Html),
            "pdf" => Some(BookFormat::Pdf),
            "epub" => Some(BookFormat::Epub),
            _ => None,
        }
    }

    /// Detect format from a file name.
    pub fn from_file_name(name: &str) -> Option<Self> {
        std::path::Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }

    /// Canonical extension.
    pub fn extension(&self) -> &'static str {
        match self {
            BookFormat::Md => "md",
            BookFormat::Txt => "txt",
            BookFormat::Html => "html",
            BookFormat::Pdf => "pdf",
            BookFormat::Epub => "epub",
        }
    }

    /// Whether the content can be served inline for reading.
    pub fn is_text(&self) -> bool {
        matches!(self, BookFormat::Md | BookFormat::Txt | BookFormat::Html)
    }
}

impl std::str::FromStr for BookFormat {
    type Err = crate::error::AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_extension(s).ok_or_else(|| {
            crate::error::AppError::Validation(format!("Unsupported book format: {}", s))
        })
    }
}
