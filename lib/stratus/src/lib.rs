// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Compute-node hypervisor driver.
//!
//! Turns instance records into running domains on a hypervisor host and
//! keeps their disks, network isolation, and migration state consistent.
//! [`HypervisorConnection`] is the entry point; everything it composes is
//! usable on its own.

pub mod cidr;
pub mod connection;
pub mod descriptor;
pub mod exec;
pub mod firewall;
pub mod host_state;
pub mod hypervisor;
pub mod image_cache;
pub mod images;
pub mod instance;
pub mod migrate;
pub mod virsh;
pub mod volume;

#[cfg(test)]
pub(crate) mod testutil;

pub use connection::{connection_uri, DiskInfo, DriverError, HypervisorConnection};
pub use exec::{Cmd, HostRunner, ProcessRunner};
pub use hypervisor::Hypervisor;
pub use instance::{BlockDeviceInfo, Instance, NetworkInfo, PowerState};
pub use virsh::VirshHypervisor;
