//! Diagnostics command - checks configuration, vault, and database health
//! without starting the server.

use anyhow::Result;

use fleetctl_daemon::config::Configuration;
use fleetctl_daemon::database::{Database, MachineStore};
use fleetctl_daemon::vault::KeyVault;

/// Load everything the daemon loads at startup and report what it finds,
/// stopping at the first failure so the operator sees exactly which layer
/// is broken.
pub async fn run(config_path: &str) -> Result<()> {
    println!("fleetctl-daemon Diagnostics");
    println!("===========================\n");

    println!("Configuration:");
    println!("--------------");
    let config = Configuration::load(config_path)?;
    println!("  File: {config_path}");
    println!("  API: {}:{}", config.api.host, config.api.port);
    println!("  SSL enabled: {}", config.api.ssl.enabled);
    println!("  Database path: {}", config.database.path.display());
    println!("  Vault key path: {}", config.vault.key_path.display());
    println!("  Rate limit: {} req / {}s", config.rate_limit.requests_per_period, config.rate_limit.period_secs);

    println!("\nKey Vault:");
    println!("----------");
    match KeyVault::load(&config.vault.key_path) {
        Ok(_) => println!("  OK: {} bytes loaded", 32),
        Err(e) => {
            println!("  FAILED: {e}");
            return Err(e.into());
        }
    }

    println!("\nDatabase:");
    println!("---------");
    let db = Database::open(&config.database.path)?;
    println!("  OK: opened {}", config.database.path.display());

    let machines = db.with_conn(MachineStore::list).await?;
    println!("  Registered machines: {}", machines.len());
    for machine in &machines {
        println!("    {} ({}) - {:?}", machine.name, machine.ip, machine.status);
    }

    println!("\nDiagnostics complete.");
    Ok(())
}
