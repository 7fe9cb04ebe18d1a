// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::reachability::AddressDiscovery;
use crate::reachability::DiscoveryError;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::Mutex;

struct State {
    failures_left: u32,
    address: IpAddr,
    calls: u32,
}

/// A fake implementation of [`AddressDiscovery`].
///
/// Fails the configured number of times with a 503, then reports a fixed
/// address.
pub struct FakeDiscovery {
    state: Mutex<State>,
}

impl FakeDiscovery {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                failures_left: 0,
                address: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
                calls: 0,
            }),
        })
    }

    pub fn with_failures(self: Arc<Self>, failures: u32) -> Arc<Self> {
        self.state.lock().unwrap().failures_left = failures;
        self
    }

    pub fn with_address(self: Arc<Self>, address: IpAddr) -> Arc<Self> {
        self.state.lock().unwrap().address = address;
        self
    }

    pub fn address(&self) -> IpAddr {
        self.state.lock().unwrap().address
    }

    pub fn calls(&self) -> u32 {
        self.state.lock().unwrap().calls
    }
}

#[async_trait::async_trait]
impl AddressDiscovery for FakeDiscovery {
    async fn public_address(&self) -> Result<IpAddr, DiscoveryError> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(DiscoveryError::Status { status: 503 });
        }
        Ok(state.address)
    }
}
