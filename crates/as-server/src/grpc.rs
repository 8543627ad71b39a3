//! Tonic service implementations bridging the generated traits onto the
//! `ConfigServer` composition root.

use crate::convert::{gossip_message_from_proto, op_from_proto, op_to_proto, ruleset_from_proto, ruleset_to_proto, strategy_to_proto, trace_node_to_proto};
use as_manager::ConfigServer;
use as_registry::Peer as RegistryPeer;
use std::sync::Arc;
use tonic::{Request, Response, Status};

pub struct Services {
    pub config: Arc<ConfigServer>,
}

fn peer_to_proto(peer: &RegistryPeer) -> as_proto::Peer {
    as_proto::Peer {
        node_id: peer.node_id,
        ip: peer.ip.clone(),
        port: peer.port as u32,
    }
}

#[tonic::async_trait]
impl as_proto::registry_server::Registry for Services {
    async fn register(&self, request: Request<as_proto::RegisterRequest>) -> Result<Response<as_proto::RegisterResponse>, Status> {
        let req = request.into_inner();
        let port = u16::try_from(req.port).map_err(|_| Status::invalid_argument("port out of range"))?;
        let resp = self.config.registry.register(req.ip, port);
        Ok(Response::new(as_proto::RegisterResponse {
            node_id: resp.node_id,
            heartbeat_interval_ms: resp.heartbeat_interval.as_millis() as u64,
            random_pick: resp.random_pick as u32,
            prob_to_r: resp.prob_to_r,
        }))
    }

    async fn heartbeat(&self, request: Request<as_proto::HeartbeatRequest>) -> Result<Response<as_proto::HeartbeatResponse>, Status> {
        let req = request.into_inner();
        let port = u16::try_from(req.port).map_err(|_| Status::invalid_argument("port out of range"))?;
        let resp = self.config.registry.heartbeat(req.node_id, req.ip, port);
        Ok(Response::new(as_proto::HeartbeatResponse {
            node_id: resp.node_id,
            peers: resp.peers.iter().map(peer_to_proto).collect(),
        }))
    }
}

#[tonic::async_trait]
impl as_proto::seed_server::Seed for Services {
    async fn sync(&self, request: Request<as_proto::GossipMessage>) -> Result<Response<as_proto::SyncResponse>, Status> {
        let message = gossip_message_from_proto(request.into_inner())?;
        self.config.gossip.receive(message);
        Ok(Response::new(as_proto::SyncResponse {}))
    }
}

#[tonic::async_trait]
impl as_proto::strategy_manager_server::StrategyManager for Services {
    async fn get_strategies(
        &self,
        request: Request<as_proto::GetStrategiesRequest>,
    ) -> Result<Response<as_proto::GetStrategiesResponse>, Status> {
        let req = request.into_inner();
        let ops: Vec<(String, f64)> = req.ops.into_iter().map(|o| (o.name, o.qps)).collect();
        let strategies = self.config.manager.get_strategies(&req.service, &ops);
        Ok(Response::new(as_proto::GetStrategiesResponse {
            strategies: strategies.iter().map(strategy_to_proto).collect(),
        }))
    }

    async fn promote(&self, request: Request<as_proto::Operation>) -> Result<Response<as_proto::PromoteResponse>, Status> {
        let op = op_from_proto(request.into_inner())?;
        self.config.manager.promote(&op);
        Ok(Response::new(as_proto::PromoteResponse {}))
    }
}

#[tonic::async_trait]
impl as_proto::evaluator_manager_server::EvaluatorManager for Services {
    async fn get_tags(&self, _request: Request<as_proto::GetTagsRequest>) -> Result<Response<as_proto::RuleSet>, Status> {
        Ok(Response::new(ruleset_to_proto(&self.config.evaluator.snapshot())))
    }

    async fn update_tags(&self, request: Request<as_proto::RuleSet>) -> Result<Response<as_proto::UpdateTagsResponse>, Status> {
        let rules = ruleset_from_proto(request.into_inner())?;
        self.config.gossip.originate(as_gossip::MessageKind::EvaluatingTags(rules));
        Ok(Response::new(as_proto::UpdateTagsResponse {}))
    }
}

#[tonic::async_trait]
impl as_proto::trace_graph_manager_server::TraceGraphManager for Services {
    async fn get_services(&self, _request: Request<as_proto::GetServicesRequest>) -> Result<Response<as_proto::GetServicesResponse>, Status> {
        Ok(Response::new(as_proto::GetServicesResponse {
            services: self.config.tg.services(),
        }))
    }

    async fn get_operations(
        &self,
        request: Request<as_proto::GetOperationsRequest>,
    ) -> Result<Response<as_proto::GetOperationsResponse>, Status> {
        let req = request.into_inner();
        let operations = self.config.tg.operations(&req.service);
        Ok(Response::new(as_proto::GetOperationsResponse {
            operations: operations.iter().map(op_to_proto).collect(),
        }))
    }

    async fn dependencies(&self, request: Request<as_proto::Operation>) -> Result<Response<as_proto::DependenciesResponse>, Status> {
        let op = op_from_proto(request.into_inner())?;
        let roots = self
            .config
            .tg
            .dependencies(&op)
            .map_err(|e| Status::not_found(e.to_string()))?;
        Ok(Response::new(as_proto::DependenciesResponse {
            roots: roots.iter().map(trace_node_to_proto).collect(),
        }))
    }
}
