//! gwadmin - an interactive terminal console for the API gateway.
//!
//! Signs in against the gateway's admin backend and lets the operator
//! browse and delete services and routes.

mod commands;

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use gwadmin_core::auth::{Destination, Navigator, Notice};
use gwadmin_core::{ApiError, Config, Console, ServiceQuery};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use commands::Command;

type Input = Lines<BufReader<Stdin>>;

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

/// Prints session transitions for the operator.
struct TerminalNavigator;

impl Navigator for TerminalNavigator {
    fn navigate(&self, destination: Destination) {
        match destination {
            Destination::AuthenticatedHome => println!("Signed in. Type 'help' for commands."),
            Destination::Login => println!("Signed out. Use 'login' to sign in."),
        }
    }

    fn notify(&self, notice: &Notice) {
        match notice {
            Notice::LoginFailed(reason) => eprintln!("Login failed: {}", reason),
            Notice::SessionExpired => eprintln!("Your session has expired."),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    init_tracing();

    let mut config = Config::load().context("Failed to load configuration")?;
    info!(api_base_url = %config.api_base_url, "gwadmin starting");

    let console = Console::connect(&config, Arc::new(TerminalNavigator))
        .context("Failed to set up the console")?;
    match console.session.user() {
        Some(user) => println!("Welcome back, {}.", user.display_name()),
        None => println!("Not signed in. Use 'login' to sign in."),
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print_prompt(&console)?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let command = match commands::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(usage) => {
                eprintln!("{}", usage);
                continue;
            }
        };
        if command == Command::Quit {
            break;
        }
        if let Err(e) = run(&console, &mut config, &mut lines, command).await {
            eprintln!("Error: {:#}", e);
            if needs_relogin(&e) {
                eprintln!("Use 'login' to sign in again.");
            }
        }
    }
    Ok(())
}

/// Whether the failure ended the session rather than just this command
fn needs_relogin(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<ApiError>()
        .is_some_and(ApiError::is_session_fatal)
}

fn print_prompt(console: &Console) -> Result<()> {
    let mut stdout = io::stdout();
    match console.session.user() {
        Some(user) => write!(stdout, "{}> ", user.email)?,
        None => write!(stdout, "gwadmin> ")?,
    }
    stdout.flush()?;
    Ok(())
}

async fn run(
    console: &Console,
    config: &mut Config,
    input: &mut Input,
    command: Command,
) -> Result<()> {
    match command {
        Command::Login { remember_me } => login(console, config, input, remember_me).await?,
        Command::Logout => {
            if !console.session.sign_out().await {
                println!("Not signed in.");
            }
        }
        Command::WhoAmI => match console.session.current() {
            Some(session) => {
                let roles: Vec<&str> = session.user.roles.iter().map(String::as_str).collect();
                println!(
                    "{} <{}> id={} locale={} roles=[{}] storage={}",
                    session.user.display_name(),
                    session.user.email,
                    session.user.id,
                    session.user.locale,
                    roles.join(", "),
                    session.scope
                );
            }
            None => println!("Not signed in."),
        },
        Command::Services { search } => {
            let query = ServiceQuery {
                search,
                ..ServiceQuery::default()
            };
            print_json(&console.api.list_services(&query).await?)?;
        }
        Command::Service { id } => print_json(&console.api.get_service(&id).await?)?,
        Command::Routes { service_id } => {
            print_json(&console.api.list_routes(&service_id).await?)?
        }
        Command::Route { id } => print_json(&console.api.get_route(&id).await?)?,
        Command::DeleteService { id } => {
            console.api.delete_service(&id).await?;
            println!("Deleted service {}", id);
        }
        Command::DeleteRoute { id } => {
            console.api.delete_route(&id).await?;
            println!("Deleted route {}", id);
        }
        Command::Help => println!("{}", commands::HELP),
        Command::Quit => {}
    }
    Ok(())
}

async fn login(
    console: &Console,
    config: &mut Config,
    input: &mut Input,
    remember_me: bool,
) -> Result<()> {
    let email = prompt_email(input, config.last_email.as_deref()).await?;
    let password = tokio::task::spawn_blocking(|| rpassword::prompt_password("Password: "))
        .await
        .context("Password prompt panicked")?
        .context("Failed to read password")?;

    match console.session.login(&email, &password, remember_me).await {
        Ok(_) => {}
        // Already reported through the navigator
        Err(ApiError::InvalidCredentials(_)) => return Ok(()),
        Err(e) => return Err(e.into()),
    }

    if config.last_email.as_deref() != Some(email.as_str()) {
        config.last_email = Some(email);
        if let Err(e) = config.save() {
            warn!(error = %e, "Failed to save config");
        }
    }
    Ok(())
}

async fn prompt_email(input: &mut Input, default: Option<&str>) -> Result<String> {
    let mut stdout = io::stdout();
    match default {
        Some(email) => write!(stdout, "Email [{}]: ", email)?,
        None => write!(stdout, "Email: ")?,
    }
    stdout.flush()?;

    let line = input.next_line().await?.unwrap_or_default();
    let email = line.trim();
    match (email.is_empty(), default) {
        (true, Some(default)) => Ok(default.to_string()),
        (true, None) => Err(anyhow::anyhow!("Email is required")),
        (false, _) => Ok(email.to_string()),
    }
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
