//! Discovery, polling and process control for DPM programmable power modules on a shared
//! Modbus RTU bus.
//!
//! The engine scans a fixed address range across a list of serial configurations, polls the
//! status block of every device it found and runs a per-device process state machine on top:
//! idle, initialise, wait for load, run (time or energy controlled, optionally with a shaped
//! current curve), wait for removal. Temperature and communication faults override the
//! process state.
//!
//! Exactly one task owns the bus. Everything else, including the state machine, queues writes
//! through a bounded command channel.
//!
//! Supported bus configurations, tried in this order:
//! * 57600 8N1
//! * 9600 8N1
//! * 19200 8N1
//! * 38400 8N1
//! * 115200 8N1
//!
//! The bus layer is generic over [`embedded_io::Read`] + [`embedded_io::Write`], so any byte
//! transport can carry it. [`serial::HostPort`] provides one for host serial ports.

pub mod bus;
pub mod bus_owner;
pub mod command;
pub mod config;
pub mod control;
pub mod curve;
pub mod device;
pub mod discovery;
pub mod energy;
pub mod error;
pub mod fsm;
pub mod notify;
pub mod persistence;
pub mod poller;
pub mod register;
pub mod registry;
pub mod scaling;
pub mod scheduler;
pub mod serial;
pub mod time;

#[cfg(test)]
mod mock_serial;
#[cfg(test)]
mod sim_bus;
