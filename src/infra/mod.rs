pub mod crypto;
#[cfg(test)]
pub mod fake_cluster;
pub mod kubernetes;
pub mod memory;
pub mod web;
