mod config;
mod convert;
mod grpc;
mod transport;

use as_manager::ConfigServer;
use as_processor::{InboundSpan, SpanFilter, SpanWriter};
use as_proto::evaluator_manager_server::EvaluatorManagerServer;
use as_proto::registry_client::RegistryClient;
use as_proto::registry_server::RegistryServer;
use as_proto::seed_server::SeedServer;
use as_proto::strategy_manager_server::StrategyManagerServer;
use as_proto::trace_graph_manager_server::TraceGraphManagerServer;
use as_registry::Peer;
use as_types::SpanTags;
use grpc::Services;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::Server;
use transport::TonicGossipTransport;
use tracing::{error, info, warn};

/// Accepts every span; filtering is a deployment-time policy this control
/// plane doesn't opinionate about.
struct AcceptAllFilter;
impl SpanFilter for AcceptAllFilter {
    fn accept(&self, _tags: &SpanTags) -> bool {
        true
    }
}

/// Persistence is out of scope; spans that reach the writer stage are logged
/// at trace level so the pipeline still has somewhere to land.
struct TracingWriter;
impl SpanWriter for TracingWriter {
    fn write(&self, span: &InboundSpan) {
        tracing::trace!(service = span.operation.service(), operation = span.operation.name(), "span processed");
    }
}

fn main() {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
        .block_on(async {
            if let Err(err) = run().await {
                eprintln!("{err}");
                std::process::exit(1);
            }
        });
}

async fn run() -> Result<(), String> {
    let cli = config::parse()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let plane_config = config::to_control_plane_config(&cli)?;
    let listen_addr: std::net::SocketAddr = cli
        .listen
        .clone()
        .unwrap_or_else(|| config::DEFAULT_LISTEN.to_string())
        .parse()
        .map_err(|e| format!("invalid --listen address: {e}"))?;
    let advertise = cli.advertise.clone().unwrap_or_else(|| listen_addr.to_string());
    let (advertise_ip, advertise_port) = split_host_port(&advertise)?;

    let runtime = tokio::runtime::Handle::current();
    let transport = Arc::new(TonicGossipTransport::new(runtime));

    // Bootstrap: either register against a peer registry to learn our node id
    // and heartbeat cadence, or self-assign an id and act as the first node
    // in the mesh.
    let (node_id, heartbeat_interval) = match &cli.registry {
        Some(registry_addr) => {
            let endpoint = format!("http://{registry_addr}");
            let mut client = RegistryClient::connect(endpoint.clone())
                .await
                .map_err(|e| format!("failed to dial registry at {registry_addr}: {e}"))?;
            let resp = client
                .register(as_proto::RegisterRequest {
                    ip: advertise_ip.clone(),
                    port: advertise_port as u32,
                })
                .await
                .map_err(|e| format!("register against {registry_addr} failed: {e}"))?
                .into_inner();
            info!(node_id = resp.node_id, registry = %registry_addr, "registered with seed registry");
            (resp.node_id, Duration::from_millis(resp.heartbeat_interval_ms))
        }
        None => {
            let node_id = rand::thread_rng().gen_range(0..(1u64 << plane_config.registry.node_id_bits));
            info!(node_id, "no --registry given, self-assigning node id as mesh bootstrap");
            (node_id, plane_config.registry.heartbeat_interval)
        }
    };

    let config_server = ConfigServer::new(
        plane_config,
        node_id,
        Arc::new(AcceptAllFilter),
        Arc::new(TracingWriter),
        transport,
    );
    config_server.start().await;

    if let Some(registry_addr) = cli.registry.clone() {
        spawn_heartbeat_loop(
            Arc::clone(&config_server),
            registry_addr,
            node_id,
            advertise_ip,
            advertise_port,
            heartbeat_interval,
        );
    }

    let services = Arc::new(Services { config: Arc::clone(&config_server) });
    let registry_services = Arc::clone(&services);
    let seed_services = Arc::clone(&services);
    let manager_services = Arc::clone(&services);
    let evaluator_services = Arc::clone(&services);
    let tg_services = Arc::clone(&services);

    info!(%listen_addr, node_id, "as-server listening");
    let serve = Server::builder()
        .add_service(RegistryServer::from_arc(registry_services))
        .add_service(SeedServer::from_arc(seed_services))
        .add_service(StrategyManagerServer::from_arc(manager_services))
        .add_service(EvaluatorManagerServer::from_arc(evaluator_services))
        .add_service(TraceGraphManagerServer::from_arc(tg_services))
        .serve(listen_addr);

    tokio::select! {
        result = serve => {
            if let Err(e) = result {
                error!(%e, "gRPC server error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    config_server.stop().await;
    Ok(())
}

fn split_host_port(addr: &str) -> Result<(String, u16), String> {
    let (host, port) = addr.rsplit_once(':').ok_or_else(|| format!("expected host:port, got {addr:?}"))?;
    let port: u16 = port.parse().map_err(|e| format!("invalid port in {addr:?}: {e}"))?;
    Ok((host.to_string(), port))
}

/// Periodically re-registers liveness with the seed registry and feeds the
/// peer list it returns into the gossip mesh's fanout set.
fn spawn_heartbeat_loop(
    config_server: Arc<ConfigServer>,
    registry_addr: String,
    node_id: u64,
    ip: String,
    port: u16,
    heartbeat_interval: Duration,
) {
    tokio::spawn(async move {
        let endpoint = format!("http://{registry_addr}");
        let mut client = match RegistryClient::connect(endpoint).await {
            Ok(client) => client,
            Err(e) => {
                warn!(%e, registry = %registry_addr, "failed to dial registry for heartbeat loop");
                return;
            }
        };
        let mut current_id = node_id;
        let mut ticker = tokio::time::interval(heartbeat_interval);
        loop {
            ticker.tick().await;
            let resp = client
                .heartbeat(as_proto::HeartbeatRequest {
                    node_id: current_id,
                    ip: ip.clone(),
                    port: port as u32,
                })
                .await;
            match resp {
                Ok(resp) => {
                    let resp = resp.into_inner();
                    current_id = resp.node_id;
                    let peers = resp
                        .peers
                        .into_iter()
                        .map(|p| Peer { node_id: p.node_id, ip: p.ip, port: p.port as u16 })
                        .collect();
                    config_server.gossip.set_peers(peers);
                }
                Err(e) => warn!(%e, "heartbeat to registry failed"),
            }
        }
    });
}
