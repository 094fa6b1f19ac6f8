//! A host side driver for Ultra-Wideband ranging radios that speak UCI over
//! a serial link.
//!
//! The driver brings up a ranging session on the radio, keeps its idea of
//! the session state in step with what the device reports, and turns the
//! binary range data notifications into distances and angles of arrival.
//!
//! The pieces, from the wire up:
//!
//! - [transport]: the byte link, a serial port or an in-memory pair
//! - [frame_codec]: the outbound envelope and inbound UCI framing
//! - [notification_decoder]: typed notifications, Q9.7 angles and CIR
//! - [session_state]: session lifecycle and the gates derived from it
//! - [smoother]: rolling averages and the measurement target count
//! - [command] and [session_config]: building the commands to send
//! - [engine]: the sender and receiver threads that tie it all together
//!
//! [sim_device] stands in for the radio when there is no hardware around.

#![warn(missing_docs)]
pub mod args;
pub mod command;
pub mod config;
pub mod engine;
pub mod frame_codec;
pub mod gui;
pub mod localizer;
pub mod notification_decoder;
pub mod session_config;
pub mod session_state;
pub mod sim_device;
pub mod smoother;
pub mod transport;
