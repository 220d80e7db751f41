pub mod blinder;
pub mod client;
pub mod config;
pub mod notifier;
pub mod otp;
pub mod pb;
pub mod ristretto;
pub mod server;
pub mod store;
