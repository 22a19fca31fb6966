#![forbid(unsafe_code)]
//! The reliable-delivery transfer engine: ordered send/receive/forward
//! sequences multiplexed over contract-paced routes, composed into a
//! `Client` and, above that, a weighted window of provider sessions.

pub mod audit;
pub mod buffers;
pub mod client;
pub mod contract;
pub mod error;
pub mod forward_sequence;
pub mod frame;
pub mod mem_transport;
pub mod multi_client;
pub mod receive_sequence;
pub mod route;
pub mod rtt;
pub mod send_sequence;
pub mod timeout;

pub use client::Client;
pub use contract::{ContractKey, ContractManager, ControlPlane};
pub use error::{Error, Result};
pub use multi_client::{MultiClientChannel, MultiClientWindow};
pub use route::{MultiRouteSelector, Route, RouteManager, Transport};
pub use timeout::Timeout;
