//! pic32flash-core - Core library for PIC32 flash programming
//!
//! This crate implements the transport-agnostic part of the PIC32
//! programming protocol: the EJTAG/MTAP instruction layer, the serial
//! execution bootstrap, Programming Executive (PE) loading and the PE
//! command set. Physical adapters only provide a [`channel::BitChannel`]
//! (or, for script-engine and bootloader devices, implement
//! [`adapter::Adapter`] directly).
//!
//! # Layers
//!
//! - [`channel`] - bit-level shift abstraction implemented per transport
//! - [`jtag`] - TAP selection, instruction injection, PE protocol
//! - [`adapter`] - capability set every programmer exposes
//! - [`family`] / [`device`] - static PIC32 family and variant tables
//! - [`target`] - one programming session binding an adapter to a variant

pub mod adapter;
pub mod channel;
pub mod crc;
pub mod device;
pub mod error;
pub mod family;
pub mod jtag;
pub mod pe;
pub mod target;

pub use error::{Error, Result};
