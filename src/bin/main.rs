use std::path::PathBuf;

use anyhow::Result;
use authgate::{
    AuthConfig, Authenticator, BanKey, CredentialHasher, CredentialRecord, Credentials,
    DatabaseConfig, IdentityId, SecretKey, TokenCodec, create_connection, resolve_config_path,
};
use clap::{Parser, Subcommand};
use tracing::{Level, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "authgate")]
#[command(about = "Pluggable authentication engine")]
struct Cli {
    /// JSON config file (defaults to $AUTHGATE_CONFIG, then ./authgate.json,
    /// then AUTHGATE_* variables)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Hash a password into a credential record
    HashPassword {
        password: String,
        #[arg(long, env = "AUTHGATE_SECRET_KEY", hide_env_values = true)]
        secret: String,
        #[arg(long, default_value_t = authgate::config::DEFAULT_WORK_FACTOR)]
        work_factor: u32,
    },
    /// Check a password against a credential record
    VerifyPassword {
        password: String,
        record: String,
        #[arg(long, env = "AUTHGATE_SECRET_KEY", hide_env_values = true)]
        secret: String,
        #[arg(long, default_value_t = authgate::config::DEFAULT_WORK_FACTOR)]
        work_factor: u32,
    },
    /// Sign a token for a subject
    IssueToken {
        subject: String,
        #[arg(long, env = "AUTHGATE_SECRET_KEY", hide_env_values = true)]
        secret: String,
        #[arg(long, default_value = "authgate")]
        issuer: String,
        #[arg(long, default_value = "localhost")]
        domain: String,
        /// Lifetime in seconds
        #[arg(long, default_value_t = authgate::config::DEFAULT_TOKEN_TTL_SECONDS)]
        ttl: u64,
    },
    /// Decode and verify a token
    VerifyToken {
        token: String,
        #[arg(long, env = "AUTHGATE_SECRET_KEY", hide_env_values = true)]
        secret: String,
        #[arg(long, default_value = "authgate")]
        issuer: String,
        #[arg(long, default_value = "localhost")]
        domain: String,
    },
    /// Initialize the identity and banlist tables
    Init {
        #[arg(long, default_value = "memory")]
        db_url: String,
    },
    /// Register an identity from a JSON payload
    Register {
        payload: String,
        /// External provider token (federated strategy)
        #[arg(long)]
        external_token: Option<String>,
        #[arg(long, default_value = "memory")]
        db_url: String,
    },
    /// Log in with username and password and print the session token
    Login {
        username: String,
        password: String,
        #[arg(long, default_value = "memory")]
        db_url: String,
    },
    /// Ban a token or, with --subject, an identity
    Ban {
        target: String,
        #[arg(long, default_value_t = false)]
        subject: bool,
        #[arg(long, default_value = "memory")]
        db_url: String,
    },
    /// Lift a token or subject ban
    Unban {
        target: String,
        #[arg(long, default_value_t = false)]
        subject: bool,
        #[arg(long, default_value = "memory")]
        db_url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("authgate=info".parse()?))
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::HashPassword {
            password,
            secret,
            work_factor,
        } => {
            let hasher = CredentialHasher::new(SecretKey::new(secret), work_factor);
            println!("{}", hasher.create_password(&password)?);
        }
        Commands::VerifyPassword {
            password,
            record,
            secret,
            work_factor,
        } => {
            let hasher = CredentialHasher::new(SecretKey::new(secret), work_factor);
            let record = CredentialRecord::new(record);
            if hasher.verify_password(&password, &record) {
                println!("Password matches");
                if hasher.needs_upgrade(&record) {
                    println!("Record uses a legacy scheme; update the credential to upgrade it");
                }
            } else {
                println!("Password does not match");
                std::process::exit(1);
            }
        }
        Commands::IssueToken {
            subject,
            secret,
            issuer,
            domain,
            ttl,
        } => {
            let codec = TokenCodec::new(&SecretKey::new(secret), issuer, domain);
            let expires_at = authgate::types::unix_now() + ttl as i64;
            let claims = codec.claims_for(&IdentityId::new(subject), expires_at);
            println!("{}", codec.sign(&claims)?);
        }
        Commands::VerifyToken {
            token,
            secret,
            issuer,
            domain,
        } => {
            let codec = TokenCodec::new(&SecretKey::new(secret), issuer, domain);
            match codec.verify(authgate::types::strip_bearer(&token)) {
                Ok(claims) => println!("{}", serde_json::to_string_pretty(&claims)?),
                Err(e) => {
                    println!("Invalid token: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Init { db_url } => {
            info!("Initializing database at {}", db_url);
            let config = load_config(cli.config)?;
            build_engine(&config, db_url).await?;
            info!("Database initialized successfully");
        }
        Commands::Register {
            payload,
            external_token,
            db_url,
        } => {
            let config = load_config(cli.config)?;
            let engine = build_engine(&config, db_url).await?;
            let payload: serde_json::Value = serde_json::from_str(&payload)?;

            let identity = engine
                .register(payload, external_token.as_deref())
                .await?;
            println!("{}", serde_json::to_string_pretty(&identity)?);
        }
        Commands::Login {
            username,
            password,
            db_url,
        } => {
            let config = load_config(cli.config)?;
            let engine = build_engine(&config, db_url).await?;

            match engine
                .login(&Credentials::password(username, password))
                .await?
            {
                Some(session) => {
                    info!("Logged in identity {}", session.identity.id);
                    println!("{}", session.token);
                }
                None => {
                    println!("Invalid username or password");
                    std::process::exit(1);
                }
            }
        }
        Commands::Ban {
            target,
            subject,
            db_url,
        } => {
            let config = load_config(cli.config)?;
            let engine = build_engine(&config, db_url).await?;
            engine.ban(ban_key(target, subject)).await;
        }
        Commands::Unban {
            target,
            subject,
            db_url,
        } => {
            let config = load_config(cli.config)?;
            let engine = build_engine(&config, db_url).await?;
            engine.unban(ban_key(target, subject)).await;
        }
    }

    Ok(())
}

fn load_config(explicit: Option<PathBuf>) -> Result<AuthConfig> {
    match explicit.or_else(resolve_config_path) {
        Some(path) => {
            info!("Loading config from {}", path.display());
            AuthConfig::load(&path)
        }
        None => AuthConfig::from_env(),
    }
}

async fn build_engine(config: &AuthConfig, db_url: String) -> Result<Authenticator> {
    let db_config = DatabaseConfig {
        url: db_url,
        ..Default::default()
    };
    let db = create_connection(db_config).await?;
    Authenticator::from_config(config, db).await
}

fn ban_key(target: String, subject: bool) -> BanKey {
    if subject {
        BanKey::Subject(IdentityId::new(target))
    } else {
        BanKey::Token(target)
    }
}
