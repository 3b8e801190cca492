// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A route decision engine that keeps no routes. It logs what the session
//! engine tells it and completes reconfiguration drains.

use bgp_session::ipc::{Endpoint, FromRde, ToRde};
use slog::{debug, info, warn, Logger};

pub fn run(ep: Endpoint<FromRde, ToRde>, log: Logger) {
    loop {
        let msg = match ep.recv() {
            Ok(msg) => msg,
            Err(_) => {
                debug!(log, "session engine gone");
                return;
            }
        };
        match msg {
            ToRde::SessionAdd { peer_id, conf } => {
                info!(log, "session added: {} AS{}",
                    conf.remote_addr, conf.remote_as; "peer_id" => peer_id);
            }
            ToRde::SessionUp { peer_id, info } => {
                info!(log, "session up: AS{} ebgp {}",
                    info.remote_as, info.ebgp; "peer_id" => peer_id);
            }
            ToRde::Update { peer_id, data } => {
                debug!(log, "update of {} bytes", data.len();
                    "peer_id" => peer_id);
            }
            ToRde::ReconfDrain => {
                if ep.send(FromRde::ReconfDrain).is_err() {
                    warn!(log, "cannot finish drain");
                    return;
                }
            }
            other => debug!(log, "{other:?}"),
        }
    }
}
