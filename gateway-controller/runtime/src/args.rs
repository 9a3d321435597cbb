use clap::{Parser, ValueEnum};
use std::time::Duration;

/// Controller configuration, settable by flag or environment.
#[derive(Clone, Debug, Parser)]
#[command(name = "mesh-gateway-controller")]
pub struct Args {
    #[arg(long, env = "GATEWAY_CONTROLLER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "GATEWAY_CONTROLLER_LOG_FORMAT", value_enum, default_value = "plain")]
    pub log_format: LogFormat,

    /// Where gateway and route records persist.
    #[arg(long, env = "GATEWAY_CONTROLLER_BACKEND", value_enum, default_value = "memory")]
    pub backend: BackendKind,

    /// KV path prefix for the replicated backend.
    #[arg(long, env = "GATEWAY_CONTROLLER_KV_PREFIX", default_value = "gateway-controller")]
    pub kv_prefix: String,

    /// Seconds between full re-syncs of every known gateway.
    #[arg(long, env = "GATEWAY_CONTROLLER_SYNC_PERIOD", default_value_t = 60)]
    pub sync_period: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Plain,
    Json,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    Memory,
    Kv,
}

impl Args {
    pub fn sync_period(&self) -> Duration {
        Duration::from_secs(self.sync_period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let args = Args::try_parse_from(["mesh-gateway-controller"]).expect("parses");
        assert_eq!(args.log_level, "info");
        assert_eq!(args.log_format, LogFormat::Plain);
        assert_eq!(args.backend, BackendKind::Memory);
        assert_eq!(args.kv_prefix, "gateway-controller");
        assert_eq!(args.sync_period(), Duration::from_secs(60));
    }

    #[test]
    fn the_replicated_backend_is_selectable() {
        let args = Args::try_parse_from([
            "mesh-gateway-controller",
            "--backend",
            "kv",
            "--kv-prefix",
            "prod/gateways",
            "--sync-period",
            "30",
        ])
        .expect("parses");
        assert_eq!(args.backend, BackendKind::Kv);
        assert_eq!(args.kv_prefix, "prod/gateways");
        assert_eq!(args.sync_period(), Duration::from_secs(30));
    }
}
