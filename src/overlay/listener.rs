//! Inbound connection listener

use crate::broker::{FrameHandler, Subscription};
use crate::identity::PeerIdentity;
use crate::overlay::connection::ConnectionContext;
use crate::overlay::frame::Frame;
use crate::overlay::main_thread::Task;
use std::sync::Arc;

/// Watches the shared channel for INIT frames addressed to `local`
pub struct Listener {
    local: PeerIdentity,
    subscription: Option<Subscription>,
}

impl Listener {
    pub fn new(local: PeerIdentity) -> Self {
        Self {
            local,
            subscription: None,
        }
    }

    /// Subscribe once; later calls are no-ops
    pub fn start(&mut self, ctx: &ConnectionContext) {
        if self.subscription.is_some() {
            return;
        }

        let local = self.local;
        let main = ctx.main.clone();
        let handler: FrameHandler = Arc::new(move |raw: &[u8]| {
            let Ok(frame) = Frame::decode(raw) else {
                return;
            };
            if frame.receiver != local || !frame.is_init() {
                return;
            }
            main.post(Task::Knock {
                sender: frame.sender,
            });
        });

        self.subscription = Some(Subscription::new(ctx.broker.clone(), &ctx.channel, handler));
        log::info!("Listening on channel {}, my name: {}", ctx.channel, self.local);
    }

    pub fn close(&mut self) {
        if self.subscription.take().is_some() {
            log::debug!("Listener for {} closed", self.local);
        }
    }

    pub fn is_listening(&self) -> bool {
        self.subscription.is_some()
    }
}
