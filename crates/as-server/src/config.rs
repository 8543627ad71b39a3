//! Command-line surface, built the way `peeps-cli`/`moire-web` assemble theirs:
//! a `Facet`-derived struct driven through `figue`.

use as_types::{Config, DefaultStrategyKind, GossipConfig, ManagerConfig, QueueConfig, RegistryConfig, SstConfig, StoreConfig};
use facet::Facet;
use figue as args;
use std::time::Duration;

#[derive(Facet, Debug)]
pub struct Cli {
    #[facet(flatten)]
    pub builtins: args::FigueBuiltins,

    /// Address this node's gRPC server binds to.
    #[facet(args::named, default)]
    pub listen: Option<String>,

    /// Address advertised to the registry for peers to dial back to.
    #[facet(args::named, default)]
    pub advertise: Option<String>,

    /// Registry seed address to register with on startup.
    #[facet(args::named, default)]
    pub registry: Option<String>,

    #[facet(args::named, default)]
    pub max_fanout: Option<usize>,
    #[facet(args::named, default)]
    pub min_sampling_rate: Option<f64>,
    #[facet(args::named, default)]
    pub scale_factor: Option<f64>,
    #[facet(args::named, default)]
    pub default_strategy: Option<String>,
}

pub const DEFAULT_LISTEN: &str = "127.0.0.1:9090";

pub fn parse() -> Result<Cli, String> {
    let figue_config = args::builder::<Cli>()
        .map_err(|e| format!("failed to build CLI schema: {e}"))?
        .cli(|cli| cli.strict())
        .help(|h| {
            h.program_name("as-server")
                .description("Adaptive distributed-tracing sampler control-plane node")
                .version(option_env!("CARGO_PKG_VERSION").unwrap_or("dev"))
        })
        .build();
    let cli = args::Driver::new(figue_config)
        .run()
        .into_result()
        .map_err(|e| e.to_string())?;
    Ok(cli.value)
}

/// Builds the aggregate `Config` from CLI overrides layered on top of the
/// defaults named in the configuration table.
pub fn to_control_plane_config(cli: &Cli) -> Result<Config, String> {
    let default_strategy = match cli.default_strategy.as_deref() {
        None | Some("dynamic") => DefaultStrategyKind::Dynamic,
        Some("adaptive") => DefaultStrategyKind::Adaptive,
        Some(other) => return Err(format!("unknown --default-strategy {other:?}, expected dynamic|adaptive")),
    };
    Ok(Config {
        sst: SstConfig {
            max_fanout: cli.max_fanout.unwrap_or(4),
        },
        gossip: GossipConfig {
            random_pick: 5,
            prob_to_r: 0.25,
            lru_size: 10_000,
            heartbeat_interval: Duration::from_secs(5),
        },
        store: StoreConfig {
            expiry_interval: Duration::from_secs(60),
        },
        queue: QueueConfig {
            min_capacity: 65_536,
            resize_interval: Duration::from_secs(5),
            retry_expiry: Duration::from_secs(30),
            worker_count: 4,
        },
        manager: ManagerConfig {
            scale_factor: cli.scale_factor.unwrap_or(1.0),
            min_sampling_rate: cli.min_sampling_rate.unwrap_or(0.001),
            default_strategy,
        },
        registry: RegistryConfig {
            node_id_bits: 20,
            heartbeat_interval: Duration::from_secs(5),
        },
    })
}
