//! Descriptor/done exchange that runs once a link is established.
//!
//! Each side sends its descriptor, receives the peer's, then sends DONE.
//! The link is synchronized once both DONE messages have crossed. The
//! machine only decides what to post next; the connection performs it.
//!
//! Send transitions (on the local send completion):
//!
//! | from             | requires          | to               |
//! |------------------|-------------------|------------------|
//! | `Init`           | descriptor posted | `DescriptorSent` |
//! | `DescriptorSent` | done posted       | `DoneSent`       |
//!
//! Receive transitions (on a received message):
//!
//! | from                 | message      | to                   |
//! |----------------------|--------------|----------------------|
//! | `Init`               | `Descriptor` | `DescriptorReceived` |
//! | `DescriptorReceived` | `Done`       | `DoneReceived`       |
//!
//! Anything else is an [`RdsmError::InvalidTransition`].

use super::message::{HandshakeMessage, RegionDescriptor};
use crate::error::{RdsmError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Init,
    DescriptorSent,
    DoneSent,
}

impl SendState {
    pub const fn name(self) -> &'static str {
        match self {
            SendState::Init => "Init",
            SendState::DescriptorSent => "DescriptorSent",
            SendState::DoneSent => "DoneSent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    Init,
    DescriptorReceived,
    DoneReceived,
}

impl RecvState {
    pub const fn name(self) -> &'static str {
        match self {
            RecvState::Init => "Init",
            RecvState::DescriptorReceived => "DescriptorReceived",
            RecvState::DoneReceived => "DoneReceived",
        }
    }
}

/// Work the connection must carry out after a transition, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeAction {
    /// Remember the peer's region descriptor.
    StorePeer(RegionDescriptor),
    /// Post the receive buffer again for the next control message.
    RepostReceive,
    SendDescriptor,
    SendDone,
}

#[derive(Debug)]
pub struct Handshake {
    send: SendState,
    recv: RecvState,
    // Posted-but-not-completed sends. The descriptor must go out once even
    // if the peer's descriptor arrives before our own send completes.
    descriptor_posted: bool,
    done_posted: bool,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshake {
    pub fn new() -> Self {
        Self {
            send: SendState::Init,
            recv: RecvState::Init,
            descriptor_posted: false,
            done_posted: false,
        }
    }

    pub fn send_state(&self) -> SendState {
        self.send
    }

    pub fn recv_state(&self) -> RecvState {
        self.recv
    }

    pub fn is_synchronized(&self) -> bool {
        self.send == SendState::DoneSent && self.recv == RecvState::DoneReceived
    }

    /// The dialing side opens the exchange as soon as the link is up.
    pub fn on_established_active(&mut self) -> Vec<HandshakeAction> {
        let mut actions = Vec::new();
        self.post_descriptor_once(&mut actions);
        actions
    }

    pub fn on_send_complete(&mut self) -> Result<Vec<HandshakeAction>> {
        self.send = match self.send {
            SendState::Init if self.descriptor_posted => SendState::DescriptorSent,
            SendState::DescriptorSent if self.done_posted => SendState::DoneSent,
            state => return Err(Self::invalid("send", state.name(), "send completion")),
        };
        tracing::debug!(state = self.send.name(), "handshake send advanced");
        let mut actions = Vec::new();
        self.maybe_post_done(&mut actions);
        Ok(actions)
    }

    pub fn on_receive(&mut self, msg: HandshakeMessage) -> Result<Vec<HandshakeAction>> {
        let mut actions = Vec::new();
        self.recv = match (self.recv, msg) {
            (RecvState::Init, HandshakeMessage::Descriptor(desc)) => {
                actions.push(HandshakeAction::StorePeer(desc));
                actions.push(HandshakeAction::RepostReceive);
                // The listening side answers here rather than on ESTABLISHED.
                self.post_descriptor_once(&mut actions);
                RecvState::DescriptorReceived
            }
            (RecvState::DescriptorReceived, HandshakeMessage::Done) => RecvState::DoneReceived,
            (state, HandshakeMessage::Descriptor(_)) => {
                return Err(Self::invalid("receive", state.name(), "descriptor message"));
            }
            (state, HandshakeMessage::Done) => {
                return Err(Self::invalid("receive", state.name(), "done message"));
            }
        };
        tracing::debug!(state = self.recv.name(), "handshake receive advanced");
        self.maybe_post_done(&mut actions);
        Ok(actions)
    }

    fn post_descriptor_once(&mut self, actions: &mut Vec<HandshakeAction>) {
        if !self.descriptor_posted {
            self.descriptor_posted = true;
            actions.push(HandshakeAction::SendDescriptor);
        }
    }

    fn maybe_post_done(&mut self, actions: &mut Vec<HandshakeAction>) {
        // The peer's DONE may already be in when our descriptor completes.
        if self.send == SendState::DescriptorSent && self.recv != RecvState::Init && !self.done_posted
        {
            self.done_posted = true;
            actions.push(HandshakeAction::SendDone);
        }
    }

    fn invalid(machine: &'static str, state: &'static str, input: &'static str) -> RdsmError {
        RdsmError::InvalidTransition {
            machine,
            state,
            input,
        }
    }
}
