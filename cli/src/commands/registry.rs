//! `apptainer-core registry` commands - store registry credentials.

use std::io::BufRead;

use apptainer_runtime::oci::credentials::{credential_store, AuthFile};
use clap::{Args, Subcommand};

/// Registry used when none is given.
const DEFAULT_REGISTRY: &str = "docker.io";

#[derive(Args)]
pub struct RegistryArgs {
    #[command(subcommand)]
    pub command: RegistryCommand,
}

#[derive(Subcommand)]
pub enum RegistryCommand {
    /// Store credentials for a registry
    Login(LoginArgs),
    /// Remove stored credentials for a registry
    Logout(LogoutArgs),
    /// List registries with stored credentials
    List,
}

#[derive(Args)]
pub struct LoginArgs {
    /// Registry server (default: docker.io)
    pub server: Option<String>,

    /// Username
    #[arg(short, long)]
    pub username: Option<String>,

    /// Password
    #[arg(short, long)]
    pub password: Option<String>,

    /// Read the password from stdin
    #[arg(long)]
    pub password_stdin: bool,
}

#[derive(Args)]
pub struct LogoutArgs {
    /// Registry server (default: docker.io)
    pub server: Option<String>,
}

fn store() -> Result<AuthFile, Box<dyn std::error::Error>> {
    credential_store().ok_or_else(|| "cannot locate the home directory for the credential store".into())
}

fn read_line(prompt: Option<&str>) -> Result<String, Box<dyn std::error::Error>> {
    if let Some(prompt) = prompt {
        eprint!("{}", prompt);
    }
    let mut input = String::new();
    std::io::stdin().lock().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

pub async fn execute(args: RegistryArgs) -> Result<(), Box<dyn std::error::Error>> {
    match args.command {
        RegistryCommand::Login(args) => {
            let server = args.server.unwrap_or_else(|| DEFAULT_REGISTRY.to_string());
            let username = match args.username {
                Some(u) => u,
                None => read_line(Some("Username: "))?,
            };
            let password = if args.password_stdin {
                read_line(None)?
            } else {
                match args.password {
                    Some(p) => p,
                    None => read_line(Some("Password: "))?,
                }
            };
            login(&store()?, &server, &username, &password)?;
            println!("Login Succeeded");
        }
        RegistryCommand::Logout(args) => {
            let server = args.server.unwrap_or_else(|| DEFAULT_REGISTRY.to_string());
            if store()?.remove(&server)? {
                println!("Removing login credentials for {}", server);
            } else {
                println!("Not logged in to {}", server);
            }
        }
        RegistryCommand::List => {
            for registry in store()?.registries()? {
                println!("{}", registry);
            }
        }
    }
    Ok(())
}

fn login(store: &AuthFile, server: &str, username: &str, password: &str) -> Result<(), Box<dyn std::error::Error>> {
    if username.is_empty() || password.is_empty() {
        return Err("username and password are required".into());
    }
    store.store(server, username, password)?;
    tracing::info!(registry = server, path = %store.path().display(), "Stored registry credentials");
    Ok(())
}
