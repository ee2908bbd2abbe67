use std::process;
use std::sync::Arc;

use slavemgr::slave::parse_slave_args;
use slavemgr::{HeadlessSlave, init_tracing, run_slave};

const USAGE: &str = "Usage: slavemgr --slave <Role> [--desktop-switch]

Roles: AccessDialog, DemoClient, DemoServer, ScreenLock, InputLock";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    let invocation = match parse_slave_args(&args) {
        Some(Ok(invocation)) => invocation,
        Some(Err(e)) => {
            eprintln!("error: {e}");
            eprintln!();
            eprintln!("{USAGE}");
            process::exit(2);
        }
        None => {
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    init_tracing();
    if invocation.desktop_switch {
        let desktop = std::env::var(slavemgr::launcher::DESKTOP_ENV).unwrap_or_default();
        tracing::info!(role = %invocation.role, %desktop, "Running on separate desktop");
    }

    run_slave(invocation.role, Arc::new(HeadlessSlave)).await?;
    Ok(())
}
