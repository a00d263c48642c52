// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

use ari_normal::{CliArgs, Dif, IpcpConfiguration, IpcpError, QosSpec, SduHandler};
use bytes::BytesMut;
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Local target printing whatever reaches it
struct Sink(mpsc::UnboundedSender<BytesMut>);

impl SduHandler for Sink {
    fn post_sdu(&self, sdu: BytesMut) {
        let _ = self.0.send(sdu);
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match IpcpConfiguration::from_cli(&args) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    println!("=== RINA normal IPC Process ===\n");
    config.print_summary();

    match run(&config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "IPCP run failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: &IpcpConfiguration) -> Result<(), IpcpError> {
    let mut dif = Dif::new(config)?;
    println!("✓ Created DIF {} with {} members", dif.name, dif.member_count());

    dif.form().await?;
    for member in dif.members() {
        println!(
            "  → {} is {} with address {:?}",
            member.name(),
            member.rib().state(),
            member.address()
        );
    }

    dif.connect_chain(QosSpec::best_effort()).await?;
    println!("✓ Data-transfer chain connected\n");

    let (Some(first), Some(last)) = (dif.members().first(), dif.members().last()) else {
        return Ok(());
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let eid = last.dt().register_local_target(Arc::new(Sink(tx)))?;
    let dst = last.address().ok_or("Last member has no address")?;

    if first.address() == Some(dst) {
        info!("Single-member DIF, nothing to send");
    } else {
        let qc = QosSpec::best_effort().cube();
        first.dt().send(dst, qc, eid, b"hello, DIF")?;

        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(sdu)) => println!(
                "✓ {} delivered {:?} to local target {}\n",
                last.name(),
                String::from_utf8_lossy(&sdu),
                eid
            ),
            _ => println!("✗ SDU was not delivered\n"),
        }
    }

    for member in dif.members() {
        let status = serde_json::to_string_pretty(&member.status())
            .map_err(ari_normal::SerializationError::from)?;
        println!("{}", status);
    }

    dif.shutdown().await?;
    println!("\n✓ DIF shut down");
    Ok(())
}
