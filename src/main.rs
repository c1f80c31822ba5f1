use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use burrow::config::{DataArgs, SecretArgs, ServeArgs};
use burrow::crypto::schnorr;
use burrow::{logging, server};
use burrow::{AccountStore, FileStorage, JsonAccountStore, Keys, Relay, SecretVault};

#[derive(Parser)]
#[command(name = "burrow")]
#[command(about = "Burrow - a nostr relay and NIP-46 bunker for email/password accounts", long_about = None)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay
    Serve(ServeArgs),

    /// Generate a new relay secret key
    Keygen,

    /// Manage custodial accounts
    Account {
        #[command(subcommand)]
        command: AccountCommands,
    },

    /// Manage client sessions
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },
}

#[derive(Subcommand)]
enum AccountCommands {
    /// Store an account's secret key, encrypted to the relay key
    Add {
        #[command(flatten)]
        secret: SecretArgs,

        #[command(flatten)]
        data: DataArgs,

        #[arg(long)]
        email: String,

        /// User secret key (hex). A new key is generated when omitted.
        #[arg(long)]
        user_secret: Option<String>,
    },
}

#[derive(Subcommand)]
enum SessionCommands {
    /// Authorize a client key to sign for an account
    Add {
        #[command(flatten)]
        data: DataArgs,

        #[arg(long)]
        email: String,

        /// Client public key (hex)
        #[arg(long)]
        client_pubkey: String,

        /// Secret the client expects back on connect. Random when omitted.
        #[arg(long)]
        connect_secret: Option<String>,
    },

    /// Revoke a client's session
    Delete {
        #[command(flatten)]
        data: DataArgs,

        #[arg(long)]
        client_pubkey: String,
    },
}

fn open_store(data: &DataArgs) -> Result<JsonAccountStore<FileStorage>> {
    JsonAccountStore::open(FileStorage::new(&data.data_dir)?)
}

fn relay_keys(secret: &SecretArgs) -> Result<Keys> {
    Keys::parse(&secret.secret).context("BURROW_SECRET is not a valid secret key")
}

async fn serve(args: ServeArgs) -> Result<()> {
    let keys = relay_keys(&args.secret)?;
    let store = Arc::new(open_store(&args.data)?);
    let relay = Relay::new(keys, store, args.relay_config());
    server::serve(relay, &args.server_config()).await
}

fn add_account(secret: &SecretArgs, data: &DataArgs, email: &str, user_secret: Option<&str>) -> Result<()> {
    let vault = SecretVault::new(Arc::new(relay_keys(secret)?));
    let user = match user_secret {
        Some(hex) => Keys::parse(hex)?,
        None => Keys::generate(),
    };
    let sealed = vault.seal_secret(&user.secret_key_hex())?;
    open_store(data)?.create_account(email, &sealed)?;

    println!("Account: {email}");
    println!("Public key: {}", user.public_key_hex());
    Ok(())
}

fn add_session(data: &DataArgs, email: &str, client_pubkey: &str, connect_secret: Option<String>) -> Result<()> {
    schnorr::parse_public_key(client_pubkey)?;
    let connect_secret = connect_secret.unwrap_or_else(|| hex::encode(rand::random::<[u8; 16]>()));
    open_store(data)?.create_session(email, client_pubkey, &connect_secret)?;

    println!("Session: {client_pubkey} -> {email}");
    println!("Connect secret: {connect_secret}");
    Ok(())
}

fn delete_session(data: &DataArgs, client_pubkey: &str) -> Result<()> {
    if open_store(data)?.delete_session(client_pubkey)? {
        println!("Deleted session {client_pubkey}");
    } else {
        println!("No session for {client_pubkey}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env.local wins over .env; neither overrides the real environment
    dotenvy::from_filename(".env.local").ok();
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    logging::init(cli.log_json)?;

    match cli.command {
        Commands::Serve(args) => serve(args).await?,
        Commands::Keygen => {
            let keys = Keys::generate();
            println!("Secret key: {}", keys.secret_key_hex());
            println!("Public key: {}", keys.public_key_hex());
        }
        Commands::Account {
            command:
                AccountCommands::Add {
                    secret,
                    data,
                    email,
                    user_secret,
                },
        } => add_account(&secret, &data, &email, user_secret.as_deref())?,
        Commands::Session { command } => match command {
            SessionCommands::Add {
                data,
                email,
                client_pubkey,
                connect_secret,
            } => add_session(&data, &email, &client_pubkey, connect_secret)?,
            SessionCommands::Delete {
                data,
                client_pubkey,
            } => delete_session(&data, &client_pubkey)?,
        },
    }

    Ok(())
}
