//! Command-line arguments for the agent daemon.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "comanda-agent", about = "Offline-first tab sync agent")]
pub struct AgentArgs {
    /// Path to the on-device redb database
    #[arg(long, env = "COMANDA_DATABASE", default_value = "./comanda.redb")]
    pub database: PathBuf,

    /// Base URL of the remote authority
    #[arg(long, env = "COMANDA_AUTHORITY", default_value = "http://localhost:7000")]
    pub authority: String,

    /// Tenant whose tabs this device works on
    #[arg(long, env = "COMANDA_TENANT")]
    pub tenant: String,

    /// Port for the local UI API
    #[arg(long, env = "COMANDA_PORT", default_value_t = 3080)]
    pub port: u16,

    /// Optional JSON file with sync tuning
    #[arg(long, env = "COMANDA_CONFIG")]
    pub config: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_args() {
        let args = AgentArgs::try_parse_from([
            "comanda-agent",
            "--tenant",
            "bar-do-ze",
            "--port",
            "4000",
            "--database",
            "/var/lib/comanda/device.redb",
        ])
        .unwrap();
        assert_eq!(args.tenant, "bar-do-ze");
        assert_eq!(args.port, 4000);
        assert_eq!(args.database, PathBuf::from("/var/lib/comanda/device.redb"));
        assert!(args.config.is_none());
    }
}
