use std::process::ExitCode;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use pathguard::authz::loader;
use pathguard::settings::Settings;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "pathguard",
    version,
    about = "Model-driven request authorization"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml", env = "PATHGUARD_CONFIG")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decide one request.
    ///
    /// Exit status: 0 allow, 1 deny, 2 when the request could not be
    /// decided (a query fault or a configuration error).
    Check {
        /// One value per request attribute, in model order
        #[arg(required = true)]
        values: Vec<String>,
        /// Print the full decision as JSON
        #[arg(long)]
        json: bool,
    },
    /// Load the model and policy and report any error
    Validate,
    /// List every role a member inherits
    Roles {
        member: String,
        #[arg(long, default_value = "g")]
        relation: String,
        #[arg(long)]
        domain: Option<String>,
    },
}

const EXIT_DENY: u8 = 1;
const EXIT_ERROR: u8 = 2;

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            ExitCode::from(EXIT_ERROR)
        }
    }
}

fn run() -> Result<ExitCode> {
    // logs go to stderr so stdout carries only answers
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(&cli.config)?;
    tracing::debug!(?settings, "Loaded configuration");

    let enforcer = loader::load_enforcer(
        &settings.authz.model_path,
        &settings.authz.policy_path,
        settings.authz.role_options(),
    )?;

    match cli.command {
        Command::Check { values, json } => {
            let mut request: Vec<&str> = values.iter().map(String::as_str).collect();
            if let Some(subject) = request.first().copied() {
                request[0] = settings.subject_or_anonymous(subject);
            }
            let decision = enforcer.enforce(&request)?;
            if json {
                println!("{}", serde_json::to_string(&decision).into_diagnostic()?);
            } else if decision.allowed {
                println!("allow");
            } else {
                println!("deny");
            }
            Ok(if decision.allowed {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(EXIT_DENY)
            })
        }
        Command::Validate => {
            let snapshot = enforcer.snapshot();
            println!(
                "ok: {} rules, {} role facts",
                snapshot.len(),
                snapshot.role_fact_count()
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Roles {
            member,
            relation,
            domain,
        } => {
            if enforcer.model().role_index(&relation).is_none() {
                miette::bail!("model has no role definition `{relation}`");
            }
            for role in enforcer.implicit_roles_for(&relation, &member, domain.as_deref()) {
                println!("{role}");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
