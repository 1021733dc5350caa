use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

/// Crate-wide error taxonomy.
///
/// Control-plane packet parsers do not use this type; they return plain
/// status values that are consumed inside the dispatch loop. Everything
/// user-facing does.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
	/// A caller-supplied argument is unusable. Nothing was allocated.
	#[error("invalid argument: {0}")]
	InvalidArg(&'static str),
	/// A flow spec asks for a combination the port cannot express.
	#[error("invalid flow: {0}")]
	InvalidFlow(&'static str),
	/// A pool, ring or table has no free element left.
	#[error("no resource: {0}")]
	NoResource(&'static str),
	/// The NIC refused a queue setup or flow rule.
	#[error("rejected by hardware")]
	HardwareReject,
	/// A blocking operation ran out of its time budget.
	#[error("timed out")]
	Timeout,
	/// Global shutdown was requested while the operation was in flight.
	#[error("aborted")]
	Aborted,
	/// A malformed control-plane packet. Dropped and counted, never fatal.
	#[error("protocol error")]
	Protocol,
	/// A session ring could not accept a demuxed packet.
	#[error("ring full")]
	RingFull,
	/// The underlying hardware queue died; the owner must reopen.
	#[error("fatal queue error")]
	Fatal,
}
