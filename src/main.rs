use apiforge::app::{open_vault, App};
use apiforge::errors::ForgeError;
use apiforge::services::config::PipelineConfig;
use apiforge::services::logger::Logger;
use apiforge::services::request::AuthScheme;
use apiforge::services::vault::{CredentialCheck, CredentialMetadata};
use apiforge::utils::cancel::CancelToken;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use std::io::{IsTerminal, Read};

#[derive(Parser)]
#[command(name = "apiforge", version, about = "Turn a goal into a validated, authenticated API call")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Plan, validate, authenticate and execute one request for GOAL")]
    Run(RunArgs),
    #[command(subcommand, about = "Manage stored credentials")]
    Vault(VaultCommand),
}

#[derive(Args)]
struct RunArgs {
    goal: String,
    #[arg(long, help = "API name or context hint passed to the planner")]
    api: Option<String>,
    #[arg(long, help = "Print the full session trace as JSON")]
    json: bool,
    #[arg(long, help = "Never prompt for credentials")]
    no_prompt: bool,
    #[arg(long)]
    max_attempts: Option<usize>,
    #[arg(long)]
    base_delay_ms: Option<u64>,
    #[arg(long)]
    max_delay_ms: Option<u64>,
    #[arg(long)]
    timeout_ms: Option<u64>,
    #[arg(long)]
    max_replans: Option<usize>,
}

#[derive(Subcommand)]
enum VaultCommand {
    #[command(about = "Store a secret for SERVICE (read from stdin when --secret is omitted)")]
    Store {
        service: String,
        #[arg(long)]
        secret: Option<String>,
        #[arg(long)]
        scope: Option<String>,
        #[arg(long, help = "RFC3339 expiry timestamp")]
        expires_at: Option<String>,
    },
    Delete {
        service: String,
    },
    List,
    #[command(about = "Check a stored credential against an auth scheme (bearer, basic, header:X, query:p)")]
    Check {
        service: String,
        #[arg(long, default_value = "bearer")]
        scheme: String,
    },
}

impl RunArgs {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(v) = self.max_attempts {
            config.max_attempts = v;
        }
        if let Some(v) = self.base_delay_ms {
            config.base_delay_ms = v;
        }
        if let Some(v) = self.max_delay_ms {
            config.max_delay_ms = v;
        }
        if let Some(v) = self.timeout_ms {
            config.request_timeout_ms = v;
        }
        if let Some(v) = self.max_replans {
            config.max_replans = v;
        }
    }
}

async fn run_goal(args: RunArgs) -> Result<bool, ForgeError> {
    let mut config = PipelineConfig::from_env()?;
    args.apply(&mut config);
    let interactive = !args.no_prompt && std::io::stdin().is_terminal();
    let app = App::initialize(config, interactive)?;

    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    let logger = app.logger.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            logger.warn("Interrupt received, cancelling session", None);
            trigger.cancel();
        }
    });

    let session = app
        .orchestrator
        .run(&args.goal, args.api.as_deref(), &cancel)
        .await;
    if args.json {
        let rendered = serde_json::to_string_pretty(&session.to_json())
            .map_err(|err| ForgeError::internal(format!("Failed to render session: {}", err)))?;
        println!("{}", rendered);
    } else {
        println!("{}", session.summary());
    }
    Ok(session.succeeded())
}

fn read_secret_from_stdin() -> Result<String, ForgeError> {
    let mut raw = String::new();
    std::io::stdin().read_to_string(&mut raw)?;
    Ok(raw.trim().to_string())
}

fn run_vault(command: VaultCommand) -> Result<bool, ForgeError> {
    let logger = Logger::new("apiforge");
    let vault = open_vault(&logger)?;
    match command {
        VaultCommand::Store {
            service,
            secret,
            scope,
            expires_at,
        } => {
            let secret = match secret {
                Some(secret) => secret,
                None => read_secret_from_stdin()?,
            };
            let expires_at = expires_at
                .map(|raw| {
                    DateTime::parse_from_rfc3339(raw.trim())
                        .map(|at| at.with_timezone(&Utc))
                        .map_err(|_| ForgeError::invalid_params("expires_at must be RFC3339"))
                })
                .transpose()?;
            vault.store(
                &service,
                &secret,
                Some(CredentialMetadata {
                    expires_at,
                    scope,
                    stored_at: None,
                }),
            )?;
            println!("Stored credential for {}", service.trim().to_lowercase());
        }
        VaultCommand::Delete { service } => {
            if vault.delete(&service)? {
                println!("Deleted credential for {}", service.trim().to_lowercase());
            } else {
                println!("No credential stored for {}", service.trim().to_lowercase());
                return Ok(false);
            }
        }
        VaultCommand::List => {
            for entry in vault.describe()? {
                let mut line = format!("{}  {}", entry.service, entry.fingerprint);
                if let Some(scope) = entry.scope {
                    line.push_str(&format!("  scope={}", scope));
                }
                if let Some(expires_at) = entry.expires_at {
                    line.push_str(&format!("  expires={}", expires_at.to_rfc3339()));
                }
                println!("{}", line);
            }
        }
        VaultCommand::Check { service, scheme } => {
            let scheme = AuthScheme::parse(&scheme).ok_or_else(|| {
                ForgeError::invalid_params(format!("Unknown auth scheme: {}", scheme))
            })?;
            let Some(credential) = vault.retrieve(&service)? else {
                println!("No credential stored for {}", service.trim().to_lowercase());
                return Ok(false);
            };
            match vault.validate(&credential, &scheme) {
                CredentialCheck::Valid => println!("{}: valid for {}", credential.service, scheme),
                CredentialCheck::Invalid(reason) => {
                    println!("{}: invalid ({})", credential.service, reason);
                    return Ok(false);
                }
            }
        }
    }
    Ok(true)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run(args) => run_goal(args).await,
        Command::Vault(command) => run_vault(command),
    };
    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            eprintln!("apiforge: {}", err);
            if let Some(hint) = &err.hint {
                eprintln!("hint: {}", hint);
            }
            std::process::exit(1);
        }
    }
}
