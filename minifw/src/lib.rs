//! Control plane of the minifw packet filter.
//!
//! The daemon keeps an ordered [`store::RuleStore`], accepts Add/Remove/View
//! requests on a Unix socket ([`server`]), and mirrors the rules into the
//! kernel where the TC classifiers enforce them ([`datapath`]).

pub mod api;
pub mod client;
pub mod config;
pub mod control;
pub mod datapath;
pub mod hook;
pub mod rule;
pub mod server;
pub mod store;
pub mod wire;
