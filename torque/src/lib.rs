//! The torque crate implements a UDP connection engine for soft-real-time sessions:
//! a delivery-notification protocol without retransmission, a puzzle-gated secure
//! handshake, reliable and unreliable event delivery, and scoped object replication
//! (ghosting). The application drives the engine by ticking a `NetInterface`.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]
#![allow(clippy::too_many_arguments)]

pub mod address;
pub mod bitstream;
pub mod connection;
pub mod event;
pub mod ghost;
pub mod interface;
pub mod object;
pub mod puzzle;
pub mod registry;
pub mod socket;
pub mod stringtable;
pub mod support;
