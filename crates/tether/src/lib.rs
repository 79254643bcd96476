//! # Tether
//!
//! Tether manages the lifecycle of container networks and their endpoints.
//!
//! Packet forwarding is delegated to pluggable [`NetworkDriver`]s and
//! address management to pluggable [`IpamDriver`]s. Network and endpoint
//! state is persisted through an optimistic-concurrency store shared by
//! cooperating controllers, so every mutating operation is written as a
//! saga: each completed step registers a compensation in a [`Rollback`],
//! and a failure unwinds the completed steps in reverse.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use tether::{Controller, ControllerConfig, EndpointOptions, IpamConf, NetworkOptions};
//!
//! # async fn example(
//! #     driver: Arc<dyn tether::NetworkDriver>,
//! #     ipam: Arc<dyn tether::IpamDriver>,
//! # ) -> tether_common::TetherResult<()> {
//! let controller = Controller::in_memory(ControllerConfig::default());
//! controller.register_driver("overlay", driver, tether::Capability::global())?;
//! controller.register_ipam_driver("default", ipam).await?;
//!
//! let options = NetworkOptions::default().with_ipam(
//!     "default",
//!     "",
//!     vec![IpamConf::with_pool("10.0.0.0/24")],
//!     Vec::new(),
//! );
//! let network = controller.new_network("overlay", "app", options).await?;
//! let endpoint = network.create_endpoint("web", EndpointOptions::default()).await?;
//!
//! endpoint.delete().await?;
//! network.delete().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod controller;
pub mod driverapi;
pub mod endpoint;
pub mod ipamapi;
pub mod network;
pub mod rollback;
pub mod sandbox;

pub use config::ControllerConfig;
pub use controller::Controller;
pub use driverapi::{Capability, DriverLoader, IpamData, NetworkDriver};
pub use endpoint::{Endpoint, EndpointInterface, EndpointOptions};
pub use ipamapi::IpamDriver;
pub use network::{IpamConf, IpamInfo, Network, NetworkOptions};
pub use rollback::Rollback;
pub use sandbox::{HostRecord, Sandbox};
