// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Metrics cmd handlers.

use super::Dispatcher;
use crate::commands::MetricsToDispatcherCmd;
use crate::error::Error;

impl Dispatcher {
    pub(super) async fn handle_metrics_cmd(
        &mut self,
        cmd: MetricsToDispatcherCmd,
    ) -> Result<(), Error> {
        match cmd {
            MetricsToDispatcherCmd::Publish(packet) => {
                // `$SYS` updates are broker publications, stored and
                // fanned out like any other message.
                self.publish_internal(
                    packet.topic(),
                    packet.qos(),
                    packet.retain(),
                    packet.message(),
                )
                .await;
                Ok(())
            }
        }
    }
}
