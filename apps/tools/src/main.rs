use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use server_api::auth::mint_token;
use shared::domain::UserId;
use storage::{MessageStore, Storage};

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://./data/chat.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Registers a user (or returns the existing id) in the directory.
    CreateUser { username: String },
    /// Issues a bearer token the server accepts for `user_id`.
    MintToken {
        user_id: i64,
        #[arg(long, env = "JWT_SECRET")]
        secret: String,
        #[arg(long, default_value_t = 24)]
        ttl_hours: i64,
    },
    /// Prints the newest messages between two users, oldest first.
    History {
        user_a: i64,
        user_b: i64,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::CreateUser { username } => {
            let storage = Storage::new(&cli.database_url).await?;
            let user_id = storage.create_user(username.trim()).await?;
            println!("created user_id={user_id}");
        }
        Command::MintToken {
            user_id,
            secret,
            ttl_hours,
        } => {
            if ttl_hours <= 0 {
                bail!("ttl-hours must be positive");
            }
            let token = mint_token(&secret, UserId(user_id), chrono::Duration::hours(ttl_hours))?;
            println!("{token}");
        }
        Command::History {
            user_a,
            user_b,
            limit,
        } => {
            let storage = Storage::new(&cli.database_url).await?;
            for user_id in [user_a, user_b] {
                if storage.username_for_user(UserId(user_id)).await?.is_none() {
                    bail!("unknown user_id={user_id}");
                }
            }
            let messages = storage
                .query(UserId(user_a), UserId(user_b), limit.max(0), 0)
                .await?;
            for message in messages {
                println!(
                    "#{} {} {} -> {}: {}",
                    message.message_id,
                    message.created_at.to_rfc3339(),
                    message.sender_id,
                    message.receiver_id,
                    message.content
                );
            }
        }
    }

    Ok(())
}
