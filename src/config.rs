//! Initialization parameters and runtime flags.

use std::net::Ipv4Addr;

bitflags! {
	/// Behaviour toggles recognized at init time. Each flag switches exactly
	/// one behaviour; flags whose behaviour lives in an external collaborator
	/// (PTP clock source, AF_XDP zero-copy, the ST 2110 framers) are carried
	/// here and exposed through accessors so those collaborators see them.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct InitFlags: u32 {
		/// Run the PTP protocol handler on control-plane ingress.
		const PTP_ENABLE = 1 << 0;
		/// Run control-plane ingress on a dedicated OS thread instead of a
		/// tasklet in the main scheduler group.
		const CNI_THREAD = 1 << 1;
		/// Share one hardware RX queue between sessions (RSQ mode).
		const SHARED_RX_QUEUE = 1 << 2;
		/// Share one hardware TX queue between sessions (TSQ mode).
		const SHARED_TX_QUEUE = 1 << 3;
		/// Do not reserve system RX queues; disables control-plane ingress.
		const DISABLE_SYSTEM_RX_QUEUES = 1 << 4;
		/// All ports draw RX buffers from one shared mempool.
		const RX_MONO_POOL = 1 << 5;
		/// All ports draw TX buffers from one shared mempool.
		const TX_MONO_POOL = 1 << 6;
		/// Run scheduler groups on plain OS threads instead of pinned cores.
		const TASKLET_THREAD = 1 << 7;
		/// Allow a scheduler group to sleep when every tasklet reports idle.
		const TASKLET_SLEEP = 1 << 8;
		/// Record per-tasklet wallclock statistics each round.
		const TASKLET_TIME_MEASURE = 1 << 9;
		/// Always copy payload into the header buffer instead of chaining
		/// buffers on TX.
		const TX_NO_CHAIN = 1 << 10;
		/// Service UDP socket RX from a scheduler tasklet with condvar wakes.
		const UDP_LCORE = 1 << 11;
		/// Default new RX flows onto the control-plane sub-queue path.
		const RX_USE_CNI = 1 << 12;
		/// Pick random UDP source ports for unbound sockets.
		const RANDOM_SRC_PORT = 1 << 13;
		/// Let TX sessions spread traffic over multiple source ports.
		const MULTI_SRC_PORT = 1 << 14;
		/// Allow RX video sessions to migrate between scheduler groups.
		const RX_VIDEO_MIGRATE = 1 << 15;
		/// Allow TX video sessions to migrate between scheduler groups.
		const TX_VIDEO_MIGRATE = 1 << 16;
		/// Keep RX video sessions on a scheduler group of their own.
		const RX_SEPARATE_VIDEO_LCORE = 1 << 17;
		/// Start and stop the device implicitly with the first/last session.
		const DEV_AUTO_START_STOP = 1 << 18;
		/// Drive PTP timestamps from the CPU timestamp counter.
		const PTP_SOURCE_TSC = 1 << 19;
		/// Disable AF_XDP zero-copy even if the kernel offers it.
		const AF_XDP_ZC_DISABLE = 1 << 20;
	}
}

/// Poll-mode-driver family backing a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmdType {
	/// Kernel-bypass user-space driver with full queue/flow control.
	DpdkUser,
	/// AF_XDP socket based driver.
	AfXdp,
	/// Kernel UDP sockets; the datapath core only stubs its queues.
	KernelSocket,
}

/// How a port obtains its IP configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetProto {
	Static,
	Dhcp,
}

/// Per-port initialization parameters.
#[derive(Debug, Clone)]
pub struct PortParams {
	pub name: String,
	pub pmd: PmdType,
	pub net_proto: NetProto,
	pub sip: Ipv4Addr,
	pub netmask: Ipv4Addr,
	pub gateway: Ipv4Addr,
}

impl PortParams {
	pub fn new(name: &str) -> Self {
		Self {
			name: name.to_string(),
			pmd: PmdType::DpdkUser,
			net_proto: NetProto::Static,
			sip: Ipv4Addr::UNSPECIFIED,
			netmask: Ipv4Addr::new(255, 255, 255, 0),
			gateway: Ipv4Addr::UNSPECIFIED,
		}
	}
}

/// Tunables with usable defaults; all may be overridden before init.
#[derive(Debug, Clone)]
pub struct VarParams {
	/// Sleep applied when an idle tasklet gives no advice, in us.
	pub sch_default_sleep_us: u64,
	/// Upper bound for any scheduler sleep, in us.
	pub sch_force_sleep_us: u64,
	/// Sleeps shorter than this are turned into a bare yield, in us.
	pub sch_zero_sleep_threshold_us: u64,
}

impl Default for VarParams {
	fn default() -> Self {
		Self {
			sch_default_sleep_us: 200,
			sch_force_sleep_us: 1000,
			sch_zero_sleep_threshold_us: 20,
		}
	}
}

/// Top-level initialization parameters, one [`PortParams`] per NIC port.
#[derive(Debug, Clone)]
pub struct InitParams {
	pub ports: Vec<PortParams>,
	pub flags: InitFlags,
	/// CPU to pin the main scheduler group to; `None` leaves the choice to
	/// the OS (implied by [`InitFlags::TASKLET_THREAD`]).
	pub main_lcore: Option<usize>,
	pub var: VarParams,
}

impl InitParams {
	pub fn new(ports: Vec<PortParams>) -> Self {
		Self {
			ports,
			flags: InitFlags::empty(),
			main_lcore: None,
			var: VarParams::default(),
		}
	}

	pub fn has_flag(&self, flag: InitFlags) -> bool {
		self.flags.contains(flag)
	}
}
