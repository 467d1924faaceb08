pub mod backoff;
pub mod conditions;
pub mod dispatch;
pub mod replicas;
pub mod strategy;
pub mod traffic;
