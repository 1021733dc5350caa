//! User-space control-plane datapath core for media-over-IP stacks.
//!
//! The crate sits between sessions that produce or consume packets and a
//! kernel-bypass NIC driver exposing raw burst queues. It multiplexes
//! hardware queues behind uniform RX/TX handles, demultiplexes shared
//! receive queues by flow, runs ARP and DHCPv4 over the same datapath,
//! schedules cooperative tasklets on dedicated cores and offers a
//! POSIX-shaped one-to-one UDP socket facade on top.
//!
//! Bring the stack up with [`Stack::init`], then open queue handles with
//! [`Stack::rxq_get`] / [`Stack::txq_get`] or go through [`UdpSocket`].

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;

pub mod arp;
pub mod cni;
pub mod config;
pub mod dhcp;
pub mod driver;
pub mod mcast;
pub mod mempool;
pub mod port;
pub mod queue;
mod ring;
pub mod sched;
pub mod stack;
pub mod udp;
pub mod wire;

mod error;

pub use crate::arp::Arp;
pub use crate::cni::{PtpLayer, PtpSink};
pub use crate::config::{InitFlags, InitParams, NetProto, PmdType, PortParams, VarParams};
pub use crate::dhcp::{Dhcp, DhcpState};
pub use crate::driver::{DevCaps, DevInfo, FlowId, LinkStatus, LoopbackNic, NicDriver};
pub use crate::error::{Error, Result};
pub use crate::mempool::{Mbuf, Mempool};
pub use crate::port::PortIf;
pub use crate::queue::{FlowSpec, RxqHandle, TxFlowSpec, TxqHandle};
pub use crate::sched::{Progress, SchedGroup, Tasklet, TaskletHandle};
pub use crate::stack::Stack;
pub use crate::udp::{MsgFlags, PollFd, UDP_MAX_BYTES, UdpSocket};
