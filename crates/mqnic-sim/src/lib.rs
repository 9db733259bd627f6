//! # MQNIC Sim
//!
//! Software device model for the MQNIC packet I/O engine.
//!
//! This crate provides:
//! - [`SimBus`]: a DMA bus with shadow buffers, a mapping budget (IOMMU
//!   exhaustion) and failure injection
//! - [`SimDevice`]: an admin channel with TX/RX queue models, RSS steering,
//!   loopback and auto-complete modes, hardware counters and fault hooks
//!
//! ```no_run
//! use mqnic_core::{Adapter, AdapterConfig, AdminChannel, DmaBus, NetStack, RxPacket};
//! use mqnic_sim::SimDevice;
//! use std::sync::Arc;
//!
//! let dev = SimDevice::with_default_caps();
//! let (tx, rx) = crossbeam_channel::unbounded::<RxPacket>();
//! let adapter = Adapter::new(
//!     AdapterConfig::default(),
//!     Arc::new(dev.clone()) as Arc<dyn AdminChannel>,
//!     dev.bus() as Arc<dyn DmaBus>,
//!     Arc::new(tx) as Arc<dyn NetStack>,
//! )
//! .unwrap();
//! adapter.activate().unwrap();
//! # drop(rx);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bus;
pub mod device;

pub use bus::SimBus;
pub use device::SimDevice;
