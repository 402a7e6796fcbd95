//! bookshelf-rs server entry point.

use bookshelf_rs::{
    auth::{self, AuthService, NewAccount},
    config::{AuditCommand, BookFormat, Cli, Command, Config, Environment, UserCommand},
    db::{AuditEntry, AuditQuery, Database, NewBook, Role, now_timestamp, timestamp_to_datetime},
    error::set_expose_internal_errors,
    server,
    storage::ContentStore,
};
use clap::Parser;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Placeholder secret shipped in the defaults.
const DEFAULT_JWT_SECRET: &str = "change-me";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Find or load config
    let config_path = cli.config.clone().or_else(Config::find_config_file);

    let config = if let Some(ref path) = config_path {
        Config::load(path)?
    } else {
        Config::default()
    };

    // Handle command
    match cli.command {
        Some(Command::Init { force }) => cmd_init(force).await,
        Some(Command::User { action }) => cmd_user(action, &config).await,
        Some(Command::Audit { action }) => cmd_audit(action, &config).await,
        Some(Command::Import { dir, category }) => cmd_import(&dir, category, &config).await,
        Some(Command::Serve { bind }) => cmd_serve(config, bind).await,
        None => {
            // Default: start server
            cmd_serve(config, None).await
        }
    }
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bookshelf_rs=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Initialize config and database.
async fn cmd_init(force: bool) -> anyhow::Result<()> {
    let config_path = PathBuf::from("config.toml");

    if config_path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {}. Use --force to overwrite.",
            config_path.display()
        );
    }

    // Write default config with a fresh signing secret
    std::fs::write(
        &config_path,
        Config::generate_default(&auth::generate_secret()),
    )?;
    println!("Created config file: {}", config_path.display());

    // Initialize database
    let config = Config::default();
    let _db = Database::open(&config.database.path)?;
    println!("Initialized database: {}", config.database.path.display());

    println!("\nEdit config.toml to configure your server.");
    println!("Then run: bookshelf-rs user add <username> --password <password> --role admin");

    Ok(())
}

/// User management commands.
async fn cmd_user(action: UserCommand, config: &Config) -> anyhow::Result<()> {
    let db = Database::open(&config.database.path)?;
    let auth = AuthService::new(
        db.clone(),
        &config.auth.jwt_secret,
        config.auth.token_hours,
        config.auth.registration_enabled(),
    );

    match action {
        UserCommand::Add {
            username,
            password,
            role,
            email,
        } => {
            let role: Role = role.parse()?;
            let password = match password {
                Some(p) => p,
                None => prompt_password("Password: ")?,
            };

            let user = auth.create_user(NewAccount {
                username,
                password,
                email,
                role: Some(role),
                ..Default::default()
            })?;
            println!(
                "Created user: {} (role: {}, id: {})",
                user.username, user.role, user.id
            );
        }

        UserCommand::Del { username } => match db.get_user_by_username(&username)? {
            Some(user) => {
                auth.delete_user(&user.id)?;
                println!("Deleted user: {}", username);
            }
            None => println!("User not found: {}", username),
        },

        UserCommand::List => {
            let users = auth.list_users()?;
            if users.is_empty() {
                println!("No users found.");
            } else {
                println!("{:<20} {:<10} {:<36} LAST LOGIN", "USERNAME", "ROLE", "ID");
                println!("{}", "-".repeat(80));
                for user in users {
                    let last_login = user
                        .last_login
                        .map(|ts| timestamp_to_datetime(ts).format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "never".to_string());
                    println!(
                        "{:<20} {:<10} {:<36} {}",
                        user.username, user.role, user.id, last_login
                    );
                }
            }
        }

        UserCommand::Passwd { username, password } => {
            let password = match password {
                Some(p) => p,
                None => prompt_password("New password: ")?,
            };

            if auth.reset_password(&username, &password)? {
                println!("Password changed for: {}", username);
            } else {
                println!("User not found: {}", username);
            }
        }

        UserCommand::Role { username, role } => {
            let role: Role = role.parse()?;
            match db.get_user_by_username(&username)? {
                Some(user) => {
                    auth.set_role(&user.id, role)?;
                    println!("Role of {} changed: {} -> {}", username, user.role, role);
                }
                None => println!("User not found: {}", username),
            }
        }
    }

    Ok(())
}

/// Audit log commands.
async fn cmd_audit(action: AuditCommand, config: &Config) -> anyhow::Result<()> {
    let db = Database::open(&config.database.path)?;

    match action {
        AuditCommand::List { limit, action } => {
            let page = db.list_audit(&AuditQuery {
                action,
                limit,
                ..Default::default()
            })?;

            if page.items.is_empty() {
                println!("No audit entries.");
                return Ok(());
            }

            let shown = page.items.len();
            println!(
                "{:<17} {:<16} {:<36} {:<16} ENTITY",
                "TIME", "ACTION", "USER", "IP"
            );
            println!("{}", "-".repeat(110));
            for entry in page.items {
                let entity = match (&entry.entity_type, &entry.entity_id) {
                    (Some(kind), Some(id)) => format!("{}:{}", kind, id),
                    _ => "-".to_string(),
                };
                println!(
                    "{:<17} {:<16} {:<36} {:<16} {}",
                    timestamp_to_datetime(entry.created_at).format("%Y-%m-%d %H:%M"),
                    entry.action,
                    entry.user_id.as_deref().unwrap_or("-"),
                    entry.ip.as_deref().unwrap_or("-"),
                    entity
                );
            }
            println!("\n{} of {} entries", shown, page.total);
        }

        AuditCommand::Prune { days } => {
            let before = now_timestamp() - days as i64 * 86_400;
            let removed = db.prune_audit(before)?;
            println!("Removed {} audit entries older than {} days", removed, days);
        }
    }

    Ok(())
}

/// First Markdown heading, or the file stem.
fn import_title(path: &Path, content: &str) -> String {
    content
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("# "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| {
            path.file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("Untitled")
                .to_string()
        })
}

/// Register every Markdown and text file under a directory as a book.
async fn cmd_import(dir: &Path, category: Option<String>, config: &Config) -> anyhow::Result<()> {
    init_logging();

    if !dir.is_dir() {
        anyhow::bail!("Not a directory: {}", dir.display());
    }

    let db = Database::open(&config.database.path)?;
    let store = ContentStore::new(&config.storage);

    let files: Vec<_> = walkdir::WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .filter_map(|e| {
            let name = e.file_name().to_str()?.to_string();
            let format = BookFormat::from_file_name(&name)?;
            matches!(format, BookFormat::Md | BookFormat::Txt)
                .then(|| (e.into_path(), name, format))
        })
        .collect();

    tracing::info!(files = files.len(), dir = %dir.display(), "Found files to import");

    let mut imported = 0usize;
    let mut skipped = 0usize;

    for (path, file_name, format) in files {
        let canonical = std::fs::canonicalize(&path).unwrap_or_else(|_| path.clone());
        let id = uuid::Uuid::new_v5(
            &uuid::Uuid::NAMESPACE_URL,
            canonical.to_string_lossy().as_bytes(),
        )
        .to_string();

        // Already imported
        if db.get_book(&id)?.is_some() {
            skipped += 1;
            continue;
        }

        let data = tokio::fs::read(&path).await?;
        let title = import_title(&path, &String::from_utf8_lossy(&data));
        let file_size = data.len() as i64;
        let stored = store.save(&id, format, data).await?;

        db.create_book(&NewBook {
            id: id.clone(),
            title: title.clone(),
            author: None,
            description: None,
            category: category.clone(),
            isbn: None,
            language: None,
            published_year: None,
            uploader_id: None,
            file_name,
            format,
            file_size,
            content_path: stored.content_path,
            content: stored.content,
            cover_image: None,
        })?;

        db.append_audit(&AuditEntry {
            id: 0,
            user_id: None,
            action: "book.create".to_string(),
            entity_type: Some("book".to_string()),
            entity_id: Some(id.clone()),
            details: Some(
                serde_json::json!({ "title": title, "source": path.display().to_string() })
                    .to_string(),
            ),
            ip: None,
            user_agent: None,
            created_at: now_timestamp(),
        })?;

        tracing::info!(book_id = %id, title = %title, "Imported");
        imported += 1;
    }

    println!("Imported {} books ({} already present)", imported, skipped);
    Ok(())
}

/// Start the server.
async fn cmd_serve(mut config: Config, bind: Option<SocketAddr>) -> anyhow::Result<()> {
    // Override bind address if specified
    if let Some(addr) = bind {
        config.server.bind = addr;
    }

    init_logging();

    let production = config.server.environment == Environment::Production;
    set_expose_internal_errors(!production);

    if config.auth.jwt_secret == DEFAULT_JWT_SECRET {
        if production {
            anyhow::bail!("auth.jwt_secret must be changed before running in production");
        }
        tracing::warn!("Using the default JWT secret, run `bookshelf-rs init` to generate one");
    }

    // Open database
    let db = Database::open(&config.database.path)?;

    tracing::info!(
        bind = %config.server.bind,
        database = %config.database.path.display(),
        environment = ?config.server.environment,
        storage = ?config.storage.mode,
        "Starting bookshelf-rs server"
    );

    // Create application state and router
    let state = server::AppState::new(config.clone(), db);
    let app = server::create_router(state)?;

    let listener = TcpListener::bind(config.server.bind).await?;
    tracing::info!(address = %config.server.bind, "Server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Prompt for password input.
fn prompt_password(prompt: &str) -> anyhow::Result<String> {
    print!("{}", prompt);
    io::stdout().flush()?;

    let mut password = String::new();
    io::stdin().read_line(&mut password)?;

    Ok(password.trim().to_string())
}
