//! Request routing across healthy cluster nodes

pub mod load_balancer;
pub mod strategy;

pub use load_balancer::{LoadBalancer, RequestTotals};
pub use strategy::{
    strategy_for, Candidate, IpHash, LeastConnections, LeastResponseTime, NodeStats, RoundRobin,
    RouteRequest, SelectionStrategy, Weighted,
};
