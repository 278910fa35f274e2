use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use kademlia::{DEFAULT_ALPHA, DEFAULT_K, KademliaConfig, Node};

#[derive(Parser, Debug)]
#[command(name = "kademlia")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:4200")]
    bind: SocketAddr,

    /// Address announced to peers, if different from the bound one.
    #[arg(long)]
    advertise: Option<SocketAddr>,

    /// Well-known node to bootstrap from. Without any, the node seeds itself.
    #[arg(short = 'B', long = "bootstrap", value_name = "ADDR")]
    bootstrap: Vec<SocketAddr>,

    /// Replication factor.
    #[arg(short, default_value_t = DEFAULT_K)]
    k: usize,

    #[arg(long, default_value_t = DEFAULT_ALPHA)]
    alpha: usize,

    /// Seconds between status log lines.
    #[arg(short, long, default_value = "60", value_parser = clap::value_parser!(u64).range(1..))]
    status_interval: u64,

    /// Print the contacts, data and age of a running node, then exit.
    #[arg(long, value_name = "ADDR")]
    inspect: Option<SocketAddr>,
}

async fn inspect(addr: SocketAddr, timeout: Duration) -> Result<()> {
    let addr = addr.to_string();
    let age = kademlia::remote_age(&addr, timeout).await.context("age query failed")?;
    let contacts = kademlia::remote_contacts(&addr, timeout).await.context("contacts query failed")?;
    let data = kademlia::remote_data(&addr, timeout).await.context("data query failed")?;

    println!("node {addr} up for {}s", age.as_secs());
    println!("contacts ({}):", contacts.len());
    for contact in &contacts {
        println!("  {} {}", contact.id, contact.addr);
    }
    println!("data ({}):", data.len());
    for entry in &data {
        println!(
            "  {} {} bytes, {}s left",
            entry.index,
            entry.value.value.len(),
            entry.value.lifetime.as_secs()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = KademliaConfig {
        replication_factor: args.k,
        alpha: args.alpha,
        advertise_addr: args.advertise,
        ..Default::default()
    };

    if let Some(target) = args.inspect {
        return inspect(target, config.rpc_timeout).await;
    }

    let node = Node::bind_with_config(&args.bind.to_string(), config).await?;
    info!("Node id: {}", node.id());

    let bootstrap: Vec<String> = if args.bootstrap.is_empty() {
        info!("No bootstrap peers given, seeding from own address");
        vec![node.node_ref().addr.clone()]
    } else {
        args.bootstrap.iter().map(ToString::to_string).collect()
    };
    node.bootstrap(&bootstrap).await.context("could not join the network")?;

    let mut interval = time::interval(Duration::from_secs(args.status_interval));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let contacts = node.contacts().await;
                let data = node.data().await;
                info!(
                    contacts = contacts.len(),
                    stored = data.len(),
                    age_secs = node.age().as_secs(),
                    "status snapshot"
                );
            }
        }
    }

    node.shutdown().await;
    Ok(())
}
