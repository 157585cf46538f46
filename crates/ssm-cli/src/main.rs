use anyhow::Context;
use clap::Parser;
use ssm_cli::{audit_tail, execute, init_tracing, load_config, AuditCommands, Cli, Commands};
use ssm_core::SecretManager;
use tracing::debug;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);
    let config = load_config(&cli)?;
    let mut stdout = std::io::stdout().lock();

    if let Commands::Audit {
        action: AuditCommands::Tail { limit },
    } = &cli.command
    {
        return audit_tail(&config, *limit, &mut stdout);
    }

    let manager = SecretManager::from_config(&config).context("starting the secret manager")?;
    let result = execute(&manager, &cli.command, &mut stdout);
    if let Err(err) = manager.shutdown() {
        debug!(error = %err, "shutdown reported an error");
    }
    result
}
