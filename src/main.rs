use std::io::{Read, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use trustgate::agent::{config::Config, daemon};
use trustgate::audit::{ActorProfile, AuditConfig, AuditSealer, AuditTrail, TracingAuditSink};
use trustgate::crypto::{
    EncryptionContext, EncryptionEnvelope, EnvelopeEncryptionService, KeyProvider,
    LocalKeyProvider,
};
use trustgate::policy::{InMemoryPolicyRepository, PolicyEngine};
use trustgate::utils;

#[derive(Parser)]
#[command(name = "trustgate", version, about = "Security and trust services daemon")]
struct AppCli {
    /// Run in daemon mode (background)
    #[arg(long)]
    daemon: bool,

    /// Config file path
    #[arg(short, long, default_value = "config.json", global = true)]
    config: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Subcommands
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new master keyring file
    Keygen {
        #[arg(long, default_value = "keyring.json")]
        keyring: String,
    },
    /// Add a new master key version to an existing keyring
    RotateKey {
        #[arg(long, default_value = "keyring.json")]
        keyring: String,
    },
    /// Encrypt stdin into an envelope printed as JSON
    Encrypt {
        #[arg(long, default_value = "keyring.json")]
        keyring: String,
        /// Encryption context entry, repeatable
        #[arg(long = "context", value_name = "KEY=VALUE")]
        context: Vec<String>,
    },
    /// Decrypt an envelope read from stdin
    Decrypt {
        #[arg(long, default_value = "keyring.json")]
        keyring: String,
    },
    /// Evaluate a request against a policy file and print the decision
    EvalPolicy {
        #[arg(long)]
        policies: String,
        #[arg(long)]
        action: String,
        #[arg(long)]
        resource: String,
        #[arg(long, default_value = "anonymous")]
        user: String,
        #[arg(long)]
        role: Option<String>,
        /// Request context as a JSON object
        #[arg(long, default_value = "{}")]
        context: String,
    },
}

fn run_daemon() -> Result<()> {
    use daemonize::Daemonize;
    let daemonize = Daemonize::new()
        .pid_file("trustgate.pid")
        .working_directory(".")
        .umask(0o027)
        .privileged_action(|| {
            info!("daemon started");
        });

    daemonize.start().map_err(|e| anyhow::anyhow!(e))?;
    Ok(())
}

fn parse_context(entries: &[String]) -> Result<Option<EncryptionContext>> {
    if entries.is_empty() {
        return Ok(None);
    }
    let mut context = EncryptionContext::new();
    for entry in entries {
        let Some((key, value)) = entry.split_once('=') else {
            bail!("context entry '{entry}' must be KEY=VALUE");
        };
        context.insert(key.to_string(), value.to_string());
    }
    Ok(Some(context))
}

fn read_stdin() -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    std::io::stdin()
        .read_to_end(&mut buf)
        .context("reading stdin")?;
    Ok(buf)
}

fn envelope_service(keyring: &str) -> Result<EnvelopeEncryptionService> {
    let provider: Arc<dyn KeyProvider> =
        Arc::new(LocalKeyProvider::open(keyring).with_context(|| format!("opening keyring {keyring}"))?);
    Ok(EnvelopeEncryptionService::new(provider))
}

async fn eval_policy(
    policies: &str,
    action: &str,
    resource: &str,
    user: ActorProfile,
    context: &str,
) -> Result<()> {
    let context: serde_json::Value = serde_json::from_str(context).context("parsing --context")?;
    let audit = AuditTrail::new(
        AuditConfig::default(),
        Arc::new(TracingAuditSink::new()),
        AuditSealer::from_env()?,
    );
    let engine = PolicyEngine::new(Arc::new(InMemoryPolicyRepository::new()), audit.clone()).await?;
    engine.load_file(policies).await?;
    let decision = engine.enforce(action, resource, &user, &context).await;
    audit.flush().await?;
    println!("{}", serde_json::to_string_pretty(&decision)?);
    Ok(())
}

async fn dispatch(args: AppCli) -> Result<()> {
    match args.command {
        Some(Commands::Keygen { keyring }) => {
            let provider = LocalKeyProvider::create(&keyring)?;
            println!("created {keyring} with key versions {:?}", provider.versions());
        }
        Some(Commands::RotateKey { keyring }) => {
            let provider = LocalKeyProvider::open(&keyring)?;
            let version = provider.rotate().await?;
            println!("active key version is now {version}");
        }
        Some(Commands::Encrypt { keyring, context }) => {
            let service = envelope_service(&keyring)?;
            let envelope = service.encrypt(&read_stdin()?, parse_context(&context)?).await?;
            println!("{}", serde_json::to_string_pretty(&envelope)?);
        }
        Some(Commands::Decrypt { keyring }) => {
            let service = envelope_service(&keyring)?;
            let envelope: EncryptionEnvelope =
                serde_json::from_slice(&read_stdin()?).context("parsing envelope JSON")?;
            let plaintext = service.decrypt(&envelope).await?;
            std::io::stdout().write_all(&plaintext)?;
        }
        Some(Commands::EvalPolicy {
            policies,
            action,
            resource,
            user,
            role,
            context,
        }) => {
            let mut actor = ActorProfile::user(user);
            if let Some(role) = role {
                actor = actor.with_role(role);
            }
            eval_policy(&policies, &action, &resource, actor, &context).await?;
        }
        None => {
            // Default: run the daemon
            let config = Config::from_file(&args.config)?;
            daemon::run(config).await?;
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = AppCli::parse();

    let json_logs = args.json_logs
        || (args.command.is_none()
            && Config::from_file(&args.config)
                .map(|c| c.json_logs)
                .unwrap_or(false));
    utils::logging::init(json_logs);

    // Fork before the runtime starts its worker threads.
    if args.daemon {
        run_daemon()?;
    }

    let runtime = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
    runtime.block_on(dispatch(args))
}
