//! Stevedore — deploy MCP server templates and serve the routing gateway.
//!
//! Subcommands:
//! - `stevedore deploy <template>`: realize a template as a container
//! - `stevedore serve`: run the gateway (router + health checker + hot reload)
//! - plus `stop`, `restart`, `status`, `list`, `logs`, `templates`, `tools`

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use stevedore::template::TemplateOrigin;
use stevedore::{
    gateway_router, registry_handle, run_template_watch, Backend, ConfigLayers, DeployOptions,
    DeployOutcome, DeploymentFilter, DeploymentManager, DiscoverOptions, GatewayRegistry,
    GatewayState, HealthChecker, HealthCheckerConfig, LogOptions, RouterConfig, Settings,
    TemplateRegistry, ToolManager, Transport,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Stevedore — MCP deployment and routing platform.
#[derive(Parser)]
#[command(
    name = "stevedore",
    version,
    about = "Stevedore — deploy MCP server templates and route clients through one gateway"
)]
struct Cli {
    /// Path to stevedore.toml [default: ./stevedore.toml or ~/.config/stevedore/stevedore.toml]
    #[arg(short, long, global = true)]
    settings: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy a template as a running MCP server
    Deploy {
        /// Template id
        template: String,
        /// Configuration file (JSON or YAML)
        #[arg(long)]
        config_file: Option<PathBuf>,
        /// key=value configuration pairs
        #[arg(short = 'c', long = "config")]
        config: Vec<String>,
        /// a__b__c=value dotted overrides
        #[arg(long = "override")]
        overrides: Vec<String>,
        /// Transport (http or stdio) [default: template default]
        #[arg(long)]
        transport: Option<String>,
        /// Explicit host port
        #[arg(short, long)]
        port: Option<u16>,
        /// Deployment name for idempotent redeploy
        #[arg(long)]
        name: Option<String>,
        /// Validate and print the plan without deploying
        #[arg(long)]
        dry_run: bool,
        /// Register the deployment with the gateway
        #[arg(long)]
        register: bool,
    },
    /// Stop and remove a deployment
    Stop {
        deployment_id: String,
    },
    /// Stop-then-start a deployment from its config snapshot
    Restart {
        deployment_id: String,
    },
    /// Show one deployment with aggregated status
    Status {
        deployment_id: String,
    },
    /// List deployments
    List {
        /// Restrict to one template
        #[arg(long)]
        template: Option<String>,
        /// Include stopped deployments
        #[arg(long)]
        all: bool,
    },
    /// Stream logs from a deployment
    Logs {
        deployment_id: String,
        /// Number of trailing lines
        #[arg(long)]
        tail: Option<u32>,
        /// Keep following new output
        #[arg(short, long)]
        follow: bool,
    },
    /// List available templates
    Templates,
    /// Discover a template's tools through the cascade
    Tools {
        template: String,
        /// Bypass the cache
        #[arg(long)]
        refresh: bool,
    },
    /// Run the gateway: router, health checker, template hot reload
    Serve {
        /// Bind address override
        #[arg(long)]
        host: Option<String>,
        /// Bind port override
        #[arg(short, long)]
        port: Option<u16>,
    },
}

fn main() -> Result<()> {
    // Settings load before the runtime exists: the worker count from
    // stevedore.toml's [gateway] section (or its GATEWAY_WORKERS override)
    // sizes the thread pool.
    let cli = Cli::parse();
    let settings = Settings::load(resolve_settings(cli.settings.as_deref()).as_deref())
        .map_err(|e| anyhow::anyhow!("failed to load settings: {}", e))?;

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    builder.worker_threads(settings.gateway.workers.max(1));
    builder.build()?.block_on(run(cli, settings))
}

async fn run(cli: Cli, settings: Settings) -> Result<()> {
    let filter = std::env::var("RUST_LOG")
        .ok()
        .or_else(|| settings.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    let cancel = CancellationToken::new();
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutting down");
        cancel_for_signal.cancel();
    });

    match cli.command {
        Commands::Deploy {
            template,
            config_file,
            config,
            overrides,
            transport,
            port,
            name,
            dry_run,
            register,
        } => {
            let manager = build_manager(&settings, register).await?;
            let layers = build_layers(config_file.as_deref(), &config, &overrides)?;
            let options = DeployOptions {
                transport: transport.as_deref().map(parse_transport).transpose()?,
                port,
                deployment_name: name,
                dry_run,
            };
            match manager.deploy(&template, &layers, options).await? {
                DeployOutcome::Plan(plan) => {
                    println!("{}", serde_json::to_string_pretty(&plan)?);
                }
                DeployOutcome::Unchanged(deployment) => {
                    tracing::info!(
                        deployment = %deployment.deployment_id,
                        "identical deployment already running"
                    );
                    println!("{}", serde_json::to_string_pretty(&deployment)?);
                }
                DeployOutcome::Deployed(deployment) => {
                    if register {
                        manager.register_with_gateway(&deployment).await?;
                    }
                    println!("{}", serde_json::to_string_pretty(&deployment)?);
                }
            }
        }
        Commands::Stop { deployment_id } => {
            let manager = build_manager(&settings, true).await?;
            manager.stop(&deployment_id).await?;
            println!("stopped {}", deployment_id);
        }
        Commands::Restart { deployment_id } => {
            let manager = build_manager(&settings, true).await?;
            let deployment = manager.restart(&deployment_id).await?;
            println!("{}", serde_json::to_string_pretty(&deployment)?);
        }
        Commands::Status { deployment_id } => {
            let manager = build_manager(&settings, true).await?;
            let deployment = manager.status(&deployment_id).await?;
            println!("{}", serde_json::to_string_pretty(&deployment)?);
        }
        Commands::List { template, all } => {
            let manager = build_manager(&settings, true).await?;
            let deployments = manager
                .list(&DeploymentFilter {
                    template_id: template,
                    include_stopped: all,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&deployments)?);
        }
        Commands::Logs {
            deployment_id,
            tail,
            follow,
        } => {
            let manager = build_manager(&settings, false).await?;
            let mut stream = manager
                .backend()
                .logs(&deployment_id, LogOptions { tail, follow })
                .await?;
            loop {
                tokio::select! {
                    line = stream.recv() => {
                        match line {
                            Some(line) => println!("{}", line),
                            None => break,
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        }
        Commands::Templates => {
            let registry = load_templates(&settings)?;
            for template in registry.list() {
                println!(
                    "{:<24} {:<10} {:<10} {}",
                    template.id, template.version, template.transport.default, template.image
                );
            }
        }
        Commands::Tools { template, refresh } => {
            let manager = Arc::new(build_manager(&settings, false).await?);
            let templates = registry_handle(load_templates(&settings)?);
            let tools = Arc::new(ToolManager::new(templates, manager));
            let discovery = tools
                .discover(
                    &template,
                    DiscoverOptions {
                        refresh,
                        ..Default::default()
                    },
                )
                .await;
            println!("{}", serde_json::to_string_pretty(&discovery)?);
        }
        Commands::Serve { host, port } => {
            run_serve(settings, host, port, cancel).await?;
        }
    }

    Ok(())
}

/// Run the gateway: axum router, health checker, and template hot reload,
/// all sharing one cancellation token.
async fn run_serve(
    settings: Settings,
    host: Option<String>,
    port: Option<u16>,
    cancel: CancellationToken,
) -> Result<()> {
    let templates = registry_handle(load_templates(&settings)?);
    let gateway = Arc::new(
        GatewayRegistry::load(settings.gateway.registry_file.clone())
            .await
            .map_err(|e| anyhow::anyhow!("failed to load gateway registry: {}", e))?,
    );
    let backend = Arc::new(Backend::new(
        settings.backend_kind()?,
        &settings.network_name,
        settings.subnet.clone(),
    ));
    let manager = Arc::new(
        DeploymentManager::new(templates.clone(), backend).with_gateway(gateway.clone()),
    );
    let tools = Arc::new(ToolManager::new(templates.clone(), manager));

    // Template hot reload: changed ids invalidate the tool cache.
    let (changed_tx, mut changed_rx) = tokio::sync::mpsc::unbounded_channel::<Vec<String>>();
    tokio::spawn(run_template_watch(
        templates.clone(),
        changed_tx,
        cancel.child_token(),
    ));
    {
        let tools = tools.clone();
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = changed_rx.recv() => {
                        match changed {
                            Some(ids) => tools.invalidate_templates(&ids),
                            None => break,
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }

    // Health checker.
    let checker = Arc::new(HealthChecker::new(
        gateway.clone(),
        HealthCheckerConfig::default(),
    ));
    tokio::spawn(checker.run(cancel.child_token()));

    // Router.
    let state = GatewayState::new(
        gateway,
        RouterConfig {
            auth: settings.auth_mode(),
            ..Default::default()
        },
    );
    let app = gateway_router(state);

    let host = host.unwrap_or(settings.gateway.host);
    let port = port.unwrap_or(settings.gateway.port);
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind to {}: {}", addr, e))?;

    tracing::info!(host = %host, port = %port, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| anyhow::anyhow!("gateway server error: {}", e))?;

    tracing::info!("gateway stopped");
    Ok(())
}

async fn build_manager(settings: &Settings, with_gateway: bool) -> Result<DeploymentManager> {
    let templates = registry_handle(load_templates(settings)?);
    let backend = Arc::new(Backend::new(
        settings.backend_kind()?,
        &settings.network_name,
        settings.subnet.clone(),
    ));
    let mut manager = DeploymentManager::new(templates, backend);
    if with_gateway {
        let gateway = GatewayRegistry::load(settings.gateway.registry_file.clone()).await?;
        manager = manager.with_gateway(Arc::new(gateway));
    }
    Ok(manager)
}

fn load_templates(settings: &Settings) -> Result<TemplateRegistry> {
    let mut roots = Vec::new();
    if let Some(ref builtin) = settings.builtin_template_root {
        roots.push((builtin.clone(), TemplateOrigin::BuiltIn));
    }
    roots.push((settings.template_root.clone(), TemplateOrigin::User));
    Ok(TemplateRegistry::discover_roots(roots)?)
}

fn build_layers(
    config_file: Option<&Path>,
    pairs: &[String],
    overrides: &[String],
) -> Result<ConfigLayers> {
    let mut layers = ConfigLayers::default();
    if let Some(path) = config_file {
        layers = layers.with_file(ConfigLayers::load_file(path)?);
    }
    for raw in pairs {
        let (key, value) = ConfigLayers::parse_pair(raw)?;
        layers = layers.with_cli_pair(key, value);
    }
    for raw in overrides {
        let (key, value) = ConfigLayers::parse_pair(raw)?;
        layers = layers.with_override(key, value);
    }
    layers.env = ConfigLayers::capture_env();
    Ok(layers)
}

fn parse_transport(raw: &str) -> Result<Transport> {
    match raw {
        "http" => Ok(Transport::Http),
        "stdio" => Ok(Transport::Stdio),
        other => Err(anyhow::anyhow!(
            "unknown transport '{}', expected http or stdio",
            other
        )),
    }
}

/// Resolve the settings path: explicit flag, ./stevedore.toml, then
/// ~/.config/stevedore/stevedore.toml. Missing everywhere means defaults.
fn resolve_settings(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let local = Path::new("stevedore.toml");
    if local.exists() {
        return Some(local.to_path_buf());
    }
    if let Some(config_dir) = dirs::config_dir() {
        let xdg = config_dir.join("stevedore").join("stevedore.toml");
        if xdg.exists() {
            return Some(xdg);
        }
    }
    None
}
