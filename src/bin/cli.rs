use std::net::IpAddr;

use ansi_term::Colour;
use clap::{Parser, Subcommand};
use cli_table::{Cell, Style, Table};
use lsat_gateway::kvstore::{KVStore, KvError, SledStore};
use lsat_gateway::secretstore::{SecretStore, SledSecretStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    banner("LSAT-Gateway CLI tool");
    let cli = Cli::parse();

    let config: lsat_gateway::config::Config = config::Config::builder()
        .add_source(config::File::with_name("config"))
        .add_source(config::Environment::with_prefix("APP"))
        .build()?
        .try_deserialize()?;

    let kv = SledStore::open(&config.data_dir)?;

    match cli.command {
        Commands::Stats {} => app_stats(&kv)?,
        Commands::Revoke { token_id_hex } => revoke(&kv, &token_id_hex)?,
        Commands::FreebiePeek { service, ip } => freebie_peek(&kv, &service, ip)?,
    }

    Ok(())
}

#[derive(Parser, Debug)]
#[clap(author, version, about = "LSAT-Gateway management CLI tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Prints aggregate counts of stored secrets.
    Stats {},
    /// Revokes a minted token's root secret by its hex-encoded token id.
    Revoke {
        token_id_hex: String,
    },
    /// Reports the remaining freebie quota mirrored to disk for a
    /// (service, client ip) pair. Only reflects the last mirrored write;
    /// the in-memory counter is authoritative while the process is up.
    FreebiePeek {
        service: String,
        ip: IpAddr,
    },
}

fn banner(quote: &str) {
    const BTC: &str = r"
        ──▄▄█▀▀▀▀▀█▄▄──
        ▄█▀░░▄░▄░░░░▀█▄
        █░░░▀█▀▀▀▀▄░░░█
        █░░░░█▄▄▄▄▀░░░█
        █░░░░█░░░░█░░░█
        ▀█▄░▀▀█▀█▀░░▄█▀
        ──▀▀█▄▄▄▄▄█▀▀──";
    let text = format!("{:-^34}\n{}\n", quote, Colour::Yellow.paint(BTC));
    println!("{}", text);
}

fn app_stats(kv: &SledStore) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let secret_count = kv
        .inner()
        .scan_prefix("lsat/proxy/secrets/")
        .count();
    let freebie_count = kv.inner().scan_prefix("lsat/proxy/freebies/").count();

    let table = vec![
        vec!["secrets".cell(), secret_count.cell()],
        vec!["freebie entries".cell(), freebie_count.cell()],
    ]
    .table()
    .title(vec!["metric".cell().bold(true), "count".cell().bold(true)]);
    cli_table::print_stdout(table)?;
    Ok(())
}

fn revoke(kv: &SledStore, token_id_hex: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let secrets = SledSecretStore::new(kv);
    secrets.revoke_secret(token_id_hex)?;
    println!("revoked {token_id_hex}");
    Ok(())
}

fn freebie_peek(
    kv: &SledStore,
    service: &str,
    ip: IpAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cidr = match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.0/24", o[0], o[1], o[2])
        }
        IpAddr::V6(v6) => {
            let s = v6.segments();
            format!("{:x}:{:x}:{:x}:{:x}::/64", s[0], s[1], s[2], s[3])
        }
    };
    let key = format!("lsat/proxy/freebies/{service}/{cidr}");
    match kv.get(&key) {
        Ok(bytes) if bytes.len() == 4 => {
            let remaining = u32::from_le_bytes(bytes.try_into().unwrap());
            println!("{key}: {remaining} remaining");
        }
        Ok(_) => println!("{key}: corrupt entry"),
        Err(KvError::NotFound) => println!("{key}: no mirrored entry (never consumed, or process restarted without a prior write)"),
        Err(e) => println!("{key}: error reading: {e}"),
    }
    Ok(())
}
