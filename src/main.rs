//! ecobj command line
//!
//! ```text
//! ecobj classes                               list the object-class catalog
//! ecobj plan --class EC_4P2 --recx 0:80       show how a request is routed
//! ecobj simulate --class EC_4P2 --fail 2      write, fail targets, read back
//! ```

use std::sync::Arc;

use anyhow::{bail, Context};
use bytes::Bytes;
use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ecobj::ec::{leader_tgt, reassemble, split_request, ClassEntry, CodecRegistry, Iod, Recx};
use ecobj::{EcConfig, EcMetrics, EcObject, MemTransport};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Erasure-coded object addressing and recovery tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (YAML, or JSON by extension)
    #[arg(long, env = "ECOBJ_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the registered object classes
    Classes {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show how a request is split over the targets
    Plan(RequestArgs),
    /// Write a pattern to in-memory targets, fail some and read it back
    Simulate {
        #[command(flatten)]
        request: RequestArgs,

        /// Logical targets to fail before reading
        #[arg(long, value_delimiter = ',')]
        fail: Vec<u32>,

        /// Distribution key
        #[arg(long, default_value = "dkey")]
        dkey: String,
    },
}

#[derive(ClapArgs, Debug)]
struct RequestArgs {
    /// Object class name
    #[arg(long, default_value = "EC_4P2")]
    class: String,

    /// Extents as IDX:NR, repeatable
    #[arg(long, value_parser = parse_recx)]
    recx: Vec<Recx>,

    /// Record size in bytes
    #[arg(long, default_value = "1")]
    rec_size: u64,

    /// Use a single value of this size instead of extents
    #[arg(long, conflicts_with = "recx")]
    single: Option<u64>,

    /// Plan an update instead of a fetch
    #[arg(long)]
    update: bool,
}

fn parse_recx(s: &str) -> Result<Recx, String> {
    let (idx, nr) = s
        .split_once(':')
        .ok_or_else(|| format!("expected IDX:NR, got {}", s))?;
    let idx = idx.trim().parse().map_err(|e| format!("bad index {}: {}", idx, e))?;
    let nr = nr.trim().parse().map_err(|e| format!("bad count {}: {}", nr, e))?;
    Ok(Recx::new(idx, nr))
}

impl RequestArgs {
    fn iod(&self) -> anyhow::Result<Iod> {
        match self.single {
            Some(size) => Ok(Iod::single("akey", size)),
            None if self.recx.is_empty() => bail!("give at least one --recx or --single"),
            None => Ok(Iod::array("akey", self.rec_size, self.recx.clone())),
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = match &args.config {
        Some(path) => EcConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EcConfig::default(),
    };
    let registry = CodecRegistry::from_config(&config).context("building codec registry")?;

    match &args.command {
        Command::Classes { json } => list_classes(&registry, *json),
        Command::Plan(request) => plan(lookup(&registry, &request.class)?, request),
        Command::Simulate {
            request,
            fail,
            dkey,
        } => simulate(lookup(&registry, &request.class)?, &config, request, fail, dkey).await,
    }
}

fn lookup<'a>(registry: &'a CodecRegistry, name: &str) -> anyhow::Result<&'a ClassEntry> {
    registry
        .by_name(name)
        .with_context(|| format!("unknown object class {}", name))
}

// =============================================================================
// Commands
// =============================================================================

fn list_classes(registry: &CodecRegistry, json: bool) -> anyhow::Result<()> {
    if json {
        let classes: Vec<_> = registry
            .classes()
            .iter()
            .map(|c| {
                serde_json::json!({
                    "id": c.id.0,
                    "name": c.name,
                    "data_targets": c.geometry.k(),
                    "parity_targets": c.geometry.p(),
                    "cell_records": c.geometry.cell_rec_nr(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&classes)?);
        return Ok(());
    }

    println!("{:<6} {:<10} {:>4} {:>4} {:>10}", "ID", "NAME", "K", "P", "CELL");
    for c in registry.classes() {
        println!(
            "{:<6} {:<10} {:>4} {:>4} {:>10}",
            c.id.0,
            c.name,
            c.geometry.k(),
            c.geometry.p(),
            c.geometry.cell_rec_nr()
        );
    }
    Ok(())
}

fn plan(class: &ClassEntry, request: &RequestArgs) -> anyhow::Result<()> {
    let geo = class.geometry;
    let iod = request.iod()?;
    let sgls = if request.update {
        vec![Bytes::from(vec![0u8; iod.data_bytes() as usize])]
    } else {
        Vec::new()
    };
    let req = reassemble(class, std::slice::from_ref(&iod), &sgls, request.update)?;
    let leader = leader_tgt(&geo, req.targets()).context("request addresses no target")?;
    let split = split_request(&geo, &req.iods, &req.oiods, req.targets(), leader, request.update)?;

    println!("class {} ({}), routing {:?}", class.name, geo, req.oiods[0]);
    for toiod in split.all() {
        let role = if toiod.tgt_idx == leader { "leader" } else { "forward" };
        for part in &toiod.iods {
            let recxs: Vec<String> = part.iod.recxs.iter().map(|r| r.to_string()).collect();
            println!(
                "  tgt {:>2} {:<7} bytes [{}, {}) {}",
                toiod.tgt_idx,
                role,
                part.off,
                part.off + part.len,
                recxs.join(" ")
            );
        }
    }
    Ok(())
}

async fn simulate(
    class: &ClassEntry,
    config: &EcConfig,
    request: &RequestArgs,
    fail: &[u32],
    dkey: &str,
) -> anyhow::Result<()> {
    let geo = class.geometry;
    let iod = request.iod()?;
    let transport = Arc::new(MemTransport::new(geo.tgt_nr()));
    let metrics = EcMetrics::new()?;
    let obj = EcObject::new(class.clone(), transport.clone(), config.io.clone(), metrics);

    let data: Vec<u8> = (0..iod.data_bytes()).map(|i| (i % 251) as u8).collect();
    let data = Bytes::from(data);
    let iods = [iod];
    let epoch = obj.update(dkey, &iods, &[data.clone()]).await?;
    info!("Wrote {} bytes at epoch {}", data.len(), epoch);

    let rot = obj.rotation(dkey);
    for &tgt in fail {
        if tgt >= geo.tgt_nr() {
            bail!("target {} out of range for {}", tgt, geo);
        }
        transport.fail_shard(rot.shard_idx(tgt));
    }

    let got = obj.fetch_with_retry(dkey, &iods).await?;
    let intact = got.first() == Some(&data);
    println!(
        "read {} bytes with failed targets {:?}: {}",
        got.first().map_or(0, |b| b.len()),
        fail,
        if intact { "intact" } else { "MISMATCH" }
    );
    print!("{}", obj.metrics().gather_text()?);
    if !intact {
        bail!("recovered data differs from what was written");
    }
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
