// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![cfg_attr(feature = "strict", deny(warnings))]
#![deny(clippy::all)]

#[macro_use]
extern crate log;

#[macro_use]
extern crate cfg_if;

#[macro_use]
extern crate static_assertions;

pub mod config;
pub mod device;
pub mod memory;
pub mod pal;
pub mod runtime;

pub use self::{
    config::{
        Config,
        DeviceConfig,
    },
    device::{
        abi::{
            RegisterMap,
            SyncCode,
            ThreadMap,
            VectorSyncRequest,
        },
        driver::DriverOps,
        inject::PacketBuffer,
        ports::{
            MacAddress,
            PortContext,
            PortList,
        },
        stats::StatsSnapshot,
        Command,
        Device,
        PollEvents,
        Session,
    },
    memory::{
        FragmentDescriptor,
        HugePageArena,
        LockPolicy,
        SegmentDescriptor,
        SharedRegion,
    },
    runtime::fail::Fail,
};

/// Ensures that two expressions are equal, bailing out of the enclosing `anyhow::Result` function otherwise.
#[macro_export]
macro_rules! ensure_eq {
    ($left:expr, $right:expr $(,)?) => {
        match (&$left, &$right) {
            (left, right) => {
                if !(*left == *right) {
                    ::anyhow::bail!(
                        "ensure_eq!({}, {}) failed\n  left: {:?}\n right: {:?}",
                        stringify!($left),
                        stringify!($right),
                        left,
                        right
                    );
                }
            },
        }
    };
}

/// Ensures that two expressions differ, bailing out of the enclosing `anyhow::Result` function otherwise.
#[macro_export]
macro_rules! ensure_neq {
    ($left:expr, $right:expr $(,)?) => {
        match (&$left, &$right) {
            (left, right) => {
                if *left == *right {
                    ::anyhow::bail!(
                        "ensure_neq!({}, {}) failed\n value: {:?}",
                        stringify!($left),
                        stringify!($right),
                        left
                    );
                }
            },
        }
    };
}
