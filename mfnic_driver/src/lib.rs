// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Command/control-plane driver core for MFNIC multi-function
//! RDMA/Ethernet adapters.
//!
//! The pieces fit together like this: [`cmd::CommandInterface`] submits
//! opcoded firmware commands through the hardware command register (or,
//! on an unprivileged function, through the communication channel),
//! [`comm::CommChannel`] runs the master side of that channel, and
//! [`eq::EqProcessor`] consumes the hardware event ring and routes
//! completions and device events to their waiters.

#![forbid(unsafe_code)]

pub mod bitmap;
pub mod cmd;
pub mod comm;
pub mod device;
pub mod emulated;
pub mod eq;
pub mod interrupt;
pub mod mailbox;
pub mod memory;
#[cfg(test)]
mod tests;
