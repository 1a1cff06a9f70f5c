//! FlowPBX daemon

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use flowpbx_call_engine::flow::{validate, FlowGraph, Severity};
use flowpbx_call_engine::{Config, JsonlCdrSink, JsonlVoicemailSink, PbxServer, StaticResolver};
use flowpbx_registrar_core::{TrunkConfig, TrunkKind};

#[derive(Parser)]
#[command(name = "flowpbx", version, about = "Self-hosted PBX core")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the PBX core.
    Serve {
        /// TOML configuration file.
        #[arg(long)]
        config: Option<PathBuf>,
        /// JSON entity snapshot (extensions, numbers, flows, ...).
        #[arg(long)]
        entities: Option<PathBuf>,
    },
    /// Validate a flow graph file and print the findings.
    ValidateFlow {
        /// JSON flow file.
        flow: PathBuf,
        /// JSON entity snapshot to validate references against.
        #[arg(long)]
        entities: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Serve { config, entities } => serve(config, entities).await,
        Command::ValidateFlow { flow, entities } => validate_flow(flow, entities).await,
    }
}

async fn serve(config_path: Option<PathBuf>, entities: Option<PathBuf>) -> anyhow::Result<()> {
    let config = Config::load(config_path.as_deref()).context("loading configuration")?;
    let (resolver, trunks) = load_entities(entities).await?;

    let cdr = Arc::new(JsonlCdrSink::new(&config.data_dir));
    let voicemail = Arc::new(JsonlVoicemailSink::new(&config.data_dir));

    let server = PbxServer::start(config, resolver.into_arc(), trunks, cdr, voicemail)
        .await
        .context("starting PBX core")?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    server.run(shutdown_rx).await;
    Ok(())
}

async fn validate_flow(flow_path: PathBuf, entities: Option<PathBuf>) -> anyhow::Result<()> {
    let text = tokio::fs::read_to_string(&flow_path)
        .await
        .with_context(|| format!("reading {}", flow_path.display()))?;
    let graph: FlowGraph = serde_json::from_str(&text).context("parsing flow JSON")?;
    let (resolver, _trunks) = load_entities(entities).await?;

    let issues = validate::validate(&graph, &resolver).await;
    let mut errors = 0;
    for issue in &issues {
        let severity = match issue.severity {
            Severity::Error => {
                errors += 1;
                "error"
            }
            Severity::Warning => "warning",
        };
        let node = issue.node_id.as_deref().unwrap_or("-");
        println!("{severity}: node {node}: {}", issue.message);
    }
    if errors > 0 {
        anyhow::bail!("{errors} error(s); the flow cannot be published");
    }
    println!("flow {:?} is publishable", graph.name);
    Ok(())
}

/// Serde shape for trunks in the entity snapshot.
#[derive(serde::Deserialize)]
struct TrunkSpec {
    id: u64,
    name: String,
    /// "register" or "ip".
    kind: String,
    #[serde(default)]
    registrar: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    auth_username: Option<String>,
    #[serde(default = "default_trunk_expiry")]
    expiry_secs: u32,
    #[serde(default)]
    networks: Vec<String>,
    #[serde(default = "default_trunk_channels")]
    max_channels: u32,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    record_calls: bool,
    #[serde(default = "default_options_interval")]
    options_interval_secs: u64,
}

fn default_trunk_expiry() -> u32 {
    3600
}
fn default_trunk_channels() -> u32 {
    4
}
fn default_enabled() -> bool {
    true
}
fn default_options_interval() -> u64 {
    60
}

impl TrunkSpec {
    fn into_config(self) -> anyhow::Result<TrunkConfig> {
        let kind = match self.kind.as_str() {
            "register" => TrunkKind::Register {
                registrar: self
                    .registrar
                    .context("register trunk needs a registrar URI")?
                    .parse()
                    .map_err(|e| anyhow::anyhow!("bad registrar URI: {e}"))?,
                username: self.username.context("register trunk needs a username")?,
                password: self.password.context("register trunk needs a password")?,
                auth_username: self.auth_username,
                expiry: self.expiry_secs,
            },
            "ip" => TrunkKind::IpAuth {
                networks: self
                    .networks
                    .iter()
                    .map(|n| n.parse())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| anyhow::anyhow!("bad trunk CIDR: {e}"))?,
            },
            other => anyhow::bail!("unknown trunk kind {other:?}"),
        };
        Ok(TrunkConfig {
            id: self.id,
            name: self.name,
            kind,
            max_channels: self.max_channels,
            enabled: self.enabled,
            record_calls: self.record_calls,
            options_interval: std::time::Duration::from_secs(self.options_interval_secs),
        })
    }
}

/// Load the JSON entity snapshot, or an empty store when none is given.
async fn load_entities(
    path: Option<PathBuf>,
) -> anyhow::Result<(StaticResolver, Vec<TrunkConfig>)> {
    let Some(path) = path else {
        return Ok((StaticResolver::default(), Vec::new()));
    };
    let text = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;

    #[derive(serde::Deserialize, Default)]
    #[serde(default)]
    struct Snapshot {
        extensions: Vec<flowpbx_call_engine::resolver::Extension>,
        inbound_numbers: Vec<flowpbx_call_engine::resolver::InboundNumber>,
        ring_groups: Vec<flowpbx_call_engine::resolver::RingGroup>,
        ivr_menus: Vec<flowpbx_call_engine::resolver::IvrMenu>,
        time_switches: Vec<flowpbx_call_engine::resolver::TimeSwitch>,
        voicemail_boxes: Vec<flowpbx_call_engine::resolver::VoicemailBox>,
        conferences: Vec<flowpbx_call_engine::resolver::ConferenceBridge>,
        flows: Vec<FlowGraph>,
        trunks: Vec<TrunkSpec>,
    }

    let snapshot: Snapshot = serde_json::from_str(&text).context("parsing entity JSON")?;
    let trunks = snapshot
        .trunks
        .into_iter()
        .map(TrunkSpec::into_config)
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok((
        StaticResolver {
            extensions: snapshot.extensions,
            inbound_numbers: snapshot.inbound_numbers,
            ring_groups: snapshot.ring_groups,
            ivr_menus: snapshot.ivr_menus,
            time_switches: snapshot.time_switches,
            voicemail_boxes: snapshot.voicemail_boxes,
            conferences: snapshot.conferences,
            flows: snapshot.flows.into_iter().map(|f| (f.id, f)).collect(),
        },
        trunks,
    ))
}
