pub mod balancer;

pub use balancer::{
    create_load_balancer, ConsistentHashBalancer, LoadBalancer, LoadBalancerStats,
    RoundRobinBalancer, WeightedRoundRobinBalancer,
};
