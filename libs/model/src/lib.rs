//! # ipruler-model
//!
//! Routing configuration shared by the controller and the agents it feeds.
//!
//! ## Contents
//!
//! - [`ConfigModel`]: rules, routes, VLANs and table-sync settings, with the
//!   same wire field names the agents parse.
//! - [`merge_configs`]: the deterministic, order-preserving union used to
//!   combine the cluster baseline with a node-group overlay.
//! - [`selector`]: exact label-subset matching and the tie-break used when
//!   several node groups select the same node.
//!
//! Everything in this crate is pure. Nothing here touches the store or the
//! network.

mod config;
mod error;
mod merge;
pub mod selector;

pub use config::{ConfigModel, RouteModel, RuleModel, SettingsModel, VlanModel};
pub use error::ModelError;
pub use merge::{dedup, merge_configs};
pub use selector::{matches, select_winner, Labels, NodeSelector, SelectorCandidate};
