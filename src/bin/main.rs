//! beesync CLI - derive and watch HD wallet addresses
//!
//!   beesync addresses --mnemonic <words> [--format bip84] [--network bitcoin] [--gap 10]
//!   beesync xpub --mnemonic <words> [--format bip84]
//!   beesync watch --server host:port [--server ...] (--mnemonic <words> | --xpub <text>)
//!
//! Output is JSON on stdout; logs go to stderr (`RUST_LOG`, `BEESYNC_LOG_JSON=1`).

use anyhow::{anyhow, bail, Context};
use beesync::electrum::{ElectrumClient, ElectrumConfig, Endpoint};
use beesync::keys::{KeyManager, KeyManagerConfig, NoopKeyEvents, WalletFormat};
use beesync::logging::init_logging;
use beesync::sync::AddressWatcher;
use beesync::{NetworkParams, Secp256k1Backend};
use serde_json::{json, Value};
use std::env;
use std::io::IsTerminal;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

fn main() {
    init_logging();

    let args: Vec<String> = env::args().collect();
    let opts = ParsedArgs::parse(&args[1..]);

    if opts.help {
        print_usage();
        return;
    }
    if opts.version {
        println!("beesync {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let result = match opts.command.as_deref() {
        Some("addresses") => cmd_addresses(&opts),
        Some("xpub") => cmd_xpub(&opts),
        Some("watch") => cmd_watch(&opts),
        Some(cmd) => Err(anyhow!("Unknown command: {}", cmd)),
        None => {
            print_usage();
            return;
        }
    };

    let pretty = opts.pretty || std::io::stdout().is_terminal();
    match result {
        Ok(output) => println!("{}", render(&output, pretty)),
        Err(e) => {
            eprintln!("{}", render(&json!({ "error": format!("{:#}", e) }), pretty));
            std::process::exit(1);
        }
    }
}

fn render(value: &Value, pretty: bool) -> String {
    let text = if pretty { serde_json::to_string_pretty(value) } else { serde_json::to_string(value) };
    text.unwrap_or_else(|_| value.to_string())
}

#[derive(Default)]
struct ParsedArgs {
    command: Option<String>,
    mnemonic: Option<String>,
    xpub: Option<String>,
    format: Option<String>,
    network: Option<String>,
    gap: Option<u32>,
    servers: Vec<String>,
    pretty: bool,
    help: bool,
    version: bool,
}

impl ParsedArgs {
    fn parse(args: &[String]) -> Self {
        let mut opts = ParsedArgs::default();
        let mut positional = Vec::new();
        let mut i = 0;

        while i < args.len() {
            let arg = &args[i];
            let next = args.get(i + 1).cloned();
            match arg.as_str() {
                "--help" | "-h" => opts.help = true,
                "--version" | "-V" => opts.version = true,
                "--pretty" => opts.pretty = true,
                "--mnemonic" | "-m" => {
                    opts.mnemonic = next;
                    i += 1;
                }
                "--xpub" | "-x" => {
                    opts.xpub = next;
                    i += 1;
                }
                "--format" | "-f" => {
                    opts.format = next;
                    i += 1;
                }
                "--network" | "-n" => {
                    opts.network = next;
                    i += 1;
                }
                "--gap" | "-g" => {
                    opts.gap = next.and_then(|s| s.parse().ok());
                    i += 1;
                }
                "--server" | "-s" => {
                    if let Some(server) = next {
                        opts.servers.push(server);
                    }
                    i += 1;
                }
                _ if !arg.starts_with('-') => positional.push(arg.clone()),
                _ => {} // Ignore unknown flags
            }
            i += 1;
        }

        if !positional.is_empty() {
            opts.command = Some(positional.remove(0));
        }

        // Environment (lower priority than CLI args)
        if opts.mnemonic.is_none() {
            opts.mnemonic = env::var("BEESYNC_MNEMONIC").ok().filter(|s| !s.is_empty());
        }
        if opts.network.is_none() {
            opts.network = env::var("BEESYNC_NETWORK").ok().filter(|s| !s.is_empty());
        }
        if opts.servers.is_empty() {
            if let Ok(servers) = env::var("BEESYNC_SERVERS") {
                opts.servers = servers.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
            }
        }

        opts
    }

    fn network(&self) -> anyhow::Result<NetworkParams> {
        let name = self.network.as_deref().unwrap_or("bitcoin");
        NetworkParams::from_name(name).ok_or_else(|| anyhow!("Unknown network: {}", name))
    }

    fn key_config(&self) -> anyhow::Result<KeyManagerConfig> {
        let format: WalletFormat = match self.format.as_deref() {
            Some(f) if f.starts_with("wallet:") => WalletFormat::from_wallet_type(f)?,
            Some(f) => f.parse()?,
            None => WalletFormat::Bip84,
        };
        let mut config = KeyManagerConfig::new(self.network()?).with_format(format);
        if let Some(gap) = self.gap {
            config = config.with_gap_limit(gap);
        }
        match (&self.mnemonic, &self.xpub) {
            (Some(words), _) => Ok(config.with_mnemonic(words.clone())),
            (None, Some(xpub)) => Ok(config.with_master_public(xpub.clone())),
            (None, None) => bail!("--mnemonic or --xpub required (env: BEESYNC_MNEMONIC)"),
        }
    }
}

fn print_usage() {
    println!(
        r#"beesync - HD wallet address derivation and Electrum sync

USAGE:
    beesync <command> [options]

COMMANDS:
    addresses               Derive addresses for every branch
    xpub                    Print the account and branch public keys
    watch                   Subscribe all addresses on Electrum servers

KEY OPTIONS:
    --mnemonic, -m <words>  BIP39 mnemonic (env: BEESYNC_MNEMONIC)
    --xpub, -x <text>       Account public key (watch-only)
    --format, -f <fmt>      bip32|bip44|bip49|bip84 or wallet:<coin>-<fmt> (default: bip84)
    --network, -n <net>     bitcoin|testnet|litecoin (env: BEESYNC_NETWORK)
    --gap, -g <n>           Gap limit (default: 10)

WATCH OPTIONS:
    --server, -s <host:port>  Electrum server, repeatable (env: BEESYNC_SERVERS)

OUTPUT OPTIONS:
    --pretty                Pretty-print JSON

ENVIRONMENT:
    RUST_LOG                Log filter (default: info)
    BEESYNC_LOG_JSON=1      JSON log lines on stderr
"#
    );
}

fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("Failed to create runtime")
}

fn cmd_addresses(opts: &ParsedArgs) -> anyhow::Result<Value> {
    let config = opts.key_config()?;
    runtime()?.block_on(async {
        let manager = KeyManager::new(config, Arc::new(NoopKeyEvents), Arc::new(Secp256k1Backend::new()))?;
        manager.load().await?;
        let mut branches = serde_json::Map::new();
        for branch in manager.branches() {
            let addresses = manager.addresses(branch).await?;
            let entries: Vec<Value> = addresses
                .iter()
                .map(|a| json!({ "path": a.path().to_string(), "address": a.display_address, "script_hash": a.script_hash }))
                .collect();
            branches.insert(branch.to_string(), Value::Array(entries));
        }
        Ok::<_, anyhow::Error>(json!({ "network": manager.network().name, "format": manager.format(), "branches": branches }))
    })
}

fn cmd_xpub(opts: &ParsedArgs) -> anyhow::Result<Value> {
    let config = opts.key_config()?;
    runtime()?.block_on(async {
        let manager = KeyManager::new(config.with_gap_limit(1), Arc::new(NoopKeyEvents), Arc::new(Secp256k1Backend::new()))?;
        manager.load().await?;
        Ok::<_, anyhow::Error>(serde_json::to_value(manager.serialized_keys())?)
    })
}

fn cmd_watch(opts: &ParsedArgs) -> anyhow::Result<Value> {
    if opts.servers.is_empty() {
        bail!("at least one --server host:port required");
    }
    let endpoints = opts
        .servers
        .iter()
        .map(|s| s.parse::<Endpoint>().map_err(|e| anyhow!(e)))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let config = opts.key_config()?;

    runtime()?.block_on(async {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let client = ElectrumClient::tcp(ElectrumConfig::new(endpoints), Arc::new(events_tx));
        let watcher = AddressWatcher::new(client.clone(), None);
        let forwarder = watcher.forward(events_rx);

        let manager = KeyManager::new(config, watcher.clone(), Arc::new(Secp256k1Backend::new()))?;
        watcher.attach(&manager);
        client.connect()?;
        manager.load().await?;
        watcher.watch_all().await?;
        let watched = watcher.watched();
        info!("Watching {} addresses, Ctrl+C to stop", watched);

        tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
        info!("Shutting down");
        let status = client.status().await?;
        client.close()?;
        forwarder.abort();

        Ok::<_, anyhow::Error>(json!({
            "watched": watched,
            "height": status.height,
            "receive": manager.get_receive_address().await?.display_address,
            "connections": status.connections,
        }))
    })
}
