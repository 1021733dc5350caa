//! Per-port multicast group membership, refcounted.
//!
//! NIC-level steering for a group comes from the flow rules the RX paths
//! install; this manager only tracks which groups the port is a member of,
//! so joins survive as long as any session or socket references them.

use std::net::Ipv4Addr;
use std::sync::Arc;

use hashbrown::HashMap;
use hermit_sync::SpinMutex;

use crate::error::{Error, Result};

/// Upper bound on distinct groups joined on one port.
pub(crate) const MCAST_GROUP_MAX: usize = 60;

pub struct McastMgr {
	port_name: String,
	groups: SpinMutex<HashMap<Ipv4Addr, u32>>,
}

impl McastMgr {
	pub(crate) fn new(port_name: &str) -> Arc<Self> {
		Arc::new(Self {
			port_name: port_name.to_string(),
			groups: SpinMutex::new(HashMap::new()),
		})
	}

	pub fn group_count(&self) -> usize {
		self.groups.lock().len()
	}

	pub fn is_member(&self, group: Ipv4Addr) -> bool {
		self.groups.lock().contains_key(&group)
	}

	pub(crate) fn join(this: &Arc<Self>, group: Ipv4Addr) -> Result<McastGuard> {
		if !group.is_multicast() {
			return Err(Error::InvalidArg("not a multicast group"));
		}
		let mut groups = this.groups.lock();
		if !groups.contains_key(&group) && groups.len() >= MCAST_GROUP_MAX {
			return Err(Error::NoResource("multicast group table full"));
		}
		let refs = groups.entry(group).or_insert(0);
		*refs += 1;
		if *refs == 1 {
			info!("mcast {}: joined {group}", this.port_name);
		}
		Ok(McastGuard {
			mgr: Arc::clone(this),
			group,
		})
	}

	fn leave(&self, group: Ipv4Addr) {
		let mut groups = self.groups.lock();
		if let Some(refs) = groups.get_mut(&group) {
			*refs -= 1;
			if *refs == 0 {
				groups.remove(&group);
				info!("mcast {}: left {group}", self.port_name);
			}
		}
	}
}

/// Keeps the membership alive; leaving happens on drop.
pub struct McastGuard {
	mgr: Arc<McastMgr>,
	group: Ipv4Addr,
}

impl McastGuard {
	pub fn group(&self) -> Ipv4Addr {
		self.group
	}
}

impl Drop for McastGuard {
	fn drop(&mut self) {
		self.mgr.leave(self.group);
	}
}
