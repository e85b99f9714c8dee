mod acquire;
mod auth;
mod cancel;
mod config;
mod coordinator;
mod error;
mod http;
mod install;
mod ipc;
mod launch;
mod manifest;
mod process;
mod roots;
mod version;

use crate::auth::AuthTicketClient;
use crate::cancel::CancelToken;
use crate::config::{
    ensure_parent, load_config, read_config, resolve_config_path, validate_config, BinaryKind,
    Config, LaunchPaths, DEFAULT_CONFIG_YAML,
};
use crate::coordinator::recorded_owner;
use crate::error::LaunchError;
use crate::http::ReqwestTransport;
use crate::launch::LaunchOrchestrator;
use crate::roots::PackageRootMap;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::flag;
use std::env;
use std::fs;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

const AUTH_COOKIE_ENV: &str = "LAUNCHPAD_AUTH_COOKIE";

#[derive(Parser, Debug)]
#[command(name = "launchpad", version, about = "Versioned client deployment and launch")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    Paths,
    /// Print the version that would be deployed.
    Resolve {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Fetch and parse the package manifest of the resolved version.
    Manifest {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Install the resolved version without launching it.
    Deploy {
        #[command(flatten)]
        target: TargetArgs,
    },
    Launch {
        /// Deep-link argument passed to the executable.
        argument: Option<String>,
        /// Launch the installed version only; never download.
        #[arg(long, default_value_t = false)]
        no_deploy: bool,
        /// Skip the singleton; no Master/Slave roles.
        #[arg(long, default_value_t = false)]
        no_coordination: bool,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Exchange the session cookie in LAUNCHPAD_AUTH_COOKIE for a launch ticket.
    Ticket,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Validate,
}

#[derive(Args, Debug, Clone, Default)]
struct TargetArgs {
    #[arg(long, value_enum)]
    binary: Option<BinaryKind>,
    #[arg(long)]
    channel: Option<String>,
    #[arg(long = "pin")]
    version_override: Option<String>,
    #[arg(long, default_value_t = false)]
    safe_mode: bool,
}

impl TargetArgs {
    fn apply(&self, cfg: &mut Config) {
        if let Some(binary) = self.binary {
            cfg.deployment.binary = binary;
        }
        if let Some(channel) = &self.channel {
            cfg.deployment.channel = channel.clone();
        }
        if let Some(version) = &self.version_override {
            cfg.deployment.version_override = version.clone();
        }
        if self.safe_mode {
            cfg.deployment.safe_mode = true;
        }
    }
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
}

#[derive(Debug, Clone)]
struct Context {
    config_path: PathBuf,
    json: bool,
    cancel: CancelToken,
}

impl Context {
    /// Config file (or defaults) with CLI overrides applied, then validated.
    fn config(&self, target: &TargetArgs) -> Result<Config, LaunchError> {
        let mut cfg = load_config(&self.config_path)?;
        target.apply(&mut cfg);
        validate_config(&cfg)?;
        Ok(cfg)
    }
}

fn main() -> Result<(), LaunchError> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;
    let ctx = build_context(&cli)?;

    let result = match cli.command {
        Commands::Config { command } => handle_config(&ctx, command),
        Commands::Paths => handle_paths(&ctx),
        Commands::Resolve { target } => handle_resolve(&ctx, &target),
        Commands::Manifest { target } => handle_manifest(&ctx, &target),
        Commands::Deploy { target } => handle_deploy(&ctx, &target),
        Commands::Launch {
            argument,
            no_deploy,
            no_coordination,
            target,
        } => handle_launch(&ctx, argument, no_deploy, no_coordination, &target),
        Commands::Ticket => handle_ticket(&ctx),
    };

    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
            };
            print_json(&payload)?;
        } else {
            eprintln!("{err}");
        }
        std::process::exit(1);
    }

    Ok(())
}

fn init_tracing(verbose: bool) -> Result<(), LaunchError> {
    let directive = if verbose {
        "launchpad=debug"
    } else {
        "launchpad=info"
    };
    let filter = EnvFilter::from_default_env().add_directive(
        directive
            .parse()
            .map_err(|err| LaunchError::Config(format!("invalid log directive: {err}")))?,
    );
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
    Ok(())
}

fn build_context(cli: &Cli) -> Result<Context, LaunchError> {
    let cancel = CancelToken::new();
    // First signal cancels cooperatively; a second one terminates even while
    // blocked in a network call.
    for signal in [SIGINT, SIGTERM] {
        flag::register_conditional_shutdown(signal, 1, cancel.flag())?;
        flag::register(signal, cancel.flag())?;
    }
    Ok(Context {
        config_path: resolve_config_path(cli.config.as_ref()),
        json: cli.json,
        cancel,
    })
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), LaunchError> {
    match command {
        ConfigCommand::Init => {
            if ctx.config_path.exists() {
                return output(ctx, json!({"path": ctx.config_path, "created": false}));
            }
            ensure_parent(&ctx.config_path)?;
            fs::write(&ctx.config_path, DEFAULT_CONFIG_YAML)?;
            output(ctx, json!({"path": ctx.config_path, "created": true}))
        }
        ConfigCommand::Validate => {
            let _cfg = read_config(&ctx.config_path)?;
            output(ctx, json!({"path": ctx.config_path, "valid": true}))
        }
    }
}

fn handle_paths(ctx: &Context) -> Result<(), LaunchError> {
    let cfg = ctx.config(&TargetArgs::default())?;
    let paths = LaunchPaths::resolve(&cfg);
    output(
        ctx,
        json!({
            "config_path": ctx.config_path,
            "config_exists": ctx.config_path.exists(),
            "root": paths.root,
            "versions_dir": paths.versions_dir,
            "downloads_dir": paths.downloads_dir,
            "runtime_dir": paths.runtime_dir,
            "lock_path": paths.lock_path,
            "lock_owner_pid": recorded_owner(&paths.lock_path),
            "socket_path": paths.socket_path,
        }),
    )
}

fn handle_resolve(ctx: &Context, target: &TargetArgs) -> Result<(), LaunchError> {
    let cfg = ctx.config(target)?;
    let orchestrator = LaunchOrchestrator::from_config(cfg, ctx.cancel.clone())?;
    let resolved = orchestrator.resolve_version()?;
    output(ctx, serde_json::to_value(resolved)?)
}

fn handle_manifest(ctx: &Context, target: &TargetArgs) -> Result<(), LaunchError> {
    let cfg = ctx.config(target)?;
    let orchestrator = LaunchOrchestrator::from_config(cfg.clone(), ctx.cancel.clone())?;
    let resolved = orchestrator.resolve_version()?;
    let deployment = cfg
        .deployment_configuration(None)
        .with_version(&resolved.version_hash);
    let manifest = orchestrator.fetch_manifest(&deployment)?;
    let roots = PackageRootMap::for_manifest(&manifest).map(|roots| roots.label());
    output(
        ctx,
        json!({
            "version": resolved,
            "url": deployment.manifest_url()?,
            "roots": roots,
            "packages": manifest.packages,
        }),
    )
}

fn handle_deploy(ctx: &Context, target: &TargetArgs) -> Result<(), LaunchError> {
    let cfg = ctx.config(target)?;
    let orchestrator = LaunchOrchestrator::from_config(cfg, ctx.cancel.clone())?;
    let deployment = orchestrator.deploy(None)?;
    output(ctx, serde_json::to_value(deployment.report)?)
}

fn handle_launch(
    ctx: &Context,
    argument: Option<String>,
    no_deploy: bool,
    no_coordination: bool,
    target: &TargetArgs,
) -> Result<(), LaunchError> {
    let mut cfg = ctx.config(target)?;
    if no_coordination {
        cfg.coordination.multi_instance = false;
    }
    let orchestrator = LaunchOrchestrator::from_config(cfg.clone(), ctx.cancel.clone())?;

    let (launched, report) = if no_deploy {
        let resolved = orchestrator.resolve_version()?;
        let deployment = cfg
            .deployment_configuration(argument)
            .with_version(&resolved.version_hash);
        let report = orchestrator.launch(&deployment)?;
        (report.launched, serde_json::to_value(report)?)
    } else {
        let report = orchestrator.deploy_and_launch(argument)?;
        (report.launch.launched, serde_json::to_value(report)?)
    };
    if !launched {
        return Err(LaunchError::Process(format!("launch failed: {report}")));
    }
    info!("launch finished");
    output(ctx, report)
}

fn handle_ticket(ctx: &Context) -> Result<(), LaunchError> {
    let cookie = env::var(AUTH_COOKIE_ENV)
        .map_err(|_| LaunchError::Config(format!("{AUTH_COOKIE_ENV} is not set")))?;
    let cfg = ctx.config(&TargetArgs::default())?;
    let transport = ReqwestTransport::new(&cfg.http)?;
    let ticket = AuthTicketClient::new(&transport, &cfg.endpoints).fetch_ticket(&cookie)?;
    output(ctx, json!({"ticket": ticket}))
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), LaunchError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), LaunchError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
