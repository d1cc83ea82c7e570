pub mod coherence;
pub mod error;
pub mod eventq;
pub mod fabric;
pub mod mem;
pub mod sim;
pub mod topology;
pub mod workload;
