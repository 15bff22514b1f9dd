//! CLI tool for administering a running relay
//!
//! Talks to the management API with the credentials of an admin account.
//!
//! # Usage
//!
//! ```bash
//! # Relay status
//! relay-admin --user admin stats
//!
//! # Latest messages across all folders
//! relay-admin messages --limit 50
//!
//! # Accounts
//! relay-admin users add forms s3cret
//! relay-admin users deactivate forms
//! relay-admin users reset-password forms n3w
//!
//! # Listener control
//! relay-admin stop
//! relay-admin start
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use relay_rs::api::handlers::{ApiError, CreateUserRequest, PasswordRequest};
use relay_rs::management::RelayStats;
use relay_rs::storage::MessageListing;
use relay_rs::users::AccountSummary;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;

#[derive(Parser)]
#[command(name = "relay-admin")]
#[command(about = "Administer a running relay", long_about = None)]
struct Cli {
    /// Management API base URL
    #[arg(long, default_value = "http://127.0.0.1:8025", env = "RELAY_API_URL")]
    api: String,

    /// Admin username
    #[arg(short, long, default_value = "admin")]
    user: String,

    /// Admin password
    #[arg(short, long, env = "RELAY_ADMIN_PASSWORD", hide_env_values = true)]
    password: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show relay statistics
    Stats,
    /// List the most recent messages
    Messages {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Start the SMTP listener
    Start,
    /// Stop the SMTP listener
    Stop,
    /// Manage relay accounts
    Users {
        #[command(subcommand)]
        command: UserCommands,
    },
}

#[derive(Subcommand)]
enum UserCommands {
    /// List all accounts
    List,
    /// Add a new account
    Add {
        username: String,
        password: String,
        /// Grant management API access
        #[arg(long)]
        admin: bool,
    },
    /// Deactivate an account
    Deactivate { username: String },
    /// Replace an account's password
    ResetPassword { username: String, password: String },
}

struct AdminClient {
    http: Client,
    base: String,
    user: String,
    password: String,
}

impl AdminClient {
    fn new(cli: &Cli) -> Self {
        Self {
            http: Client::new(),
            base: cli.api.trim_end_matches('/').to_string(),
            user: cli.user.clone(),
            password: cli.password.clone(),
        }
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.http
            .get(format!("{}{}", self.base, path))
            .basic_auth(&self.user, Some(&self.password))
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.http
            .post(format!("{}{}", self.base, path))
            .basic_auth(&self.user, Some(&self.password))
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> anyhow::Result<T> {
        let response = request.send().await.context("Cannot reach management API")?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> anyhow::Result<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        match response.json::<ApiError>().await {
            Ok(err) => bail!("{} ({})", err.error, status),
            Err(_) => bail!("Request failed ({})", status),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let client = AdminClient::new(&cli);

    match cli.command {
        Commands::Stats => {
            let stats: RelayStats = client.send(client.get("/api/stats")).await?;

            let state = if stats.running { "running" } else { "stopped" };
            println!("Relay:              {}", state);
            if let Some(addr) = &stats.listen_address {
                println!("Listening on:       {}", addr);
            }
            println!("Uptime:             {}s", stats.uptime_secs);
            println!("Active connections: {}", stats.active_connections);
            println!("Queue size:         {}", stats.queue_size);
            println!("Accounts:           {}", stats.account_count);
            println!(
                "Messages:           {} incoming, {} sent, {} failed",
                stats.folders.incoming, stats.folders.sent, stats.folders.failed
            );
        }
        Commands::Messages { limit } => {
            let messages: Vec<MessageListing> = client
                .send(client.get("/api/messages").query(&[("limit", limit)]))
                .await?;

            if messages.is_empty() {
                println!("No messages found.");
            } else {
                println!("{:<10} {:<22} {:<30} {:<30}", "Folder", "Received", "From", "Subject");
                println!("{:-<92}", "");

                for listing in &messages {
                    let meta = &listing.metadata;
                    println!(
                        "{:<10} {:<22} {:<30} {:<30}",
                        listing.folder.as_str(),
                        meta.received_at.format("%Y-%m-%d %H:%M:%S"),
                        meta.envelope.from,
                        meta.subject.as_deref().unwrap_or("(no subject)")
                    );
                }

                println!("\nTotal: {} message(s)", messages.len());
            }
        }
        Commands::Start => {
            let _: serde_json::Value = client.send(client.post("/api/relay/start")).await?;
            println!("✓ Relay started");
        }
        Commands::Stop => {
            let _: serde_json::Value = client.send(client.post("/api/relay/stop")).await?;
            println!("✓ Relay stopped");
        }
        Commands::Users { command } => match command {
            UserCommands::List => {
                let users: Vec<AccountSummary> = client.send(client.get("/api/users")).await?;

                if users.is_empty() {
                    println!("No users found.");
                } else {
                    println!(
                        "{:<20} {:<6} {:<7} {:<20} {:<20} {:>6}",
                        "Username", "Admin", "Active", "Created At", "Last Login", "Sent"
                    );
                    println!("{:-<84}", "");

                    for user in &users {
                        let last_login = user
                            .last_login
                            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                            .unwrap_or_else(|| "Never".to_string());
                        println!(
                            "{:<20} {:<6} {:<7} {:<20} {:<20} {:>6}",
                            user.username,
                            if user.is_admin { "yes" } else { "no" },
                            if user.active { "yes" } else { "no" },
                            user.created.format("%Y-%m-%d %H:%M"),
                            last_login,
                            user.messages_sent
                        );
                    }

                    println!("\nTotal: {} user(s)", users.len());
                }
            }
            UserCommands::Add {
                username,
                password,
                admin,
            } => {
                println!("Adding user: {}", username);
                let request = CreateUserRequest {
                    username: username.clone(),
                    password,
                    is_admin: admin,
                };
                let _: AccountSummary = client.send(client.post("/api/users").json(&request)).await?;
                println!("✓ User {} added successfully", username);
            }
            UserCommands::Deactivate { username } => {
                let _: serde_json::Value = client
                    .send(client.post(&format!("/api/users/{}/deactivate", username)))
                    .await?;
                println!("✓ User {} deactivated", username);
            }
            UserCommands::ResetPassword { username, password } => {
                let _: serde_json::Value = client
                    .send(
                        client
                            .post(&format!("/api/users/{}/password", username))
                            .json(&PasswordRequest { password }),
                    )
                    .await?;
                println!("✓ Password updated for {}", username);
            }
        },
    }

    Ok(())
}
