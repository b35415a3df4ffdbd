//! Per-connection negotiation state.
//!
//! The session is driven by the connection manager: it records the
//! description exchange, holds back local candidates until gathering has
//! finished and the connection can be addressed, and decides when ICE loss
//! means the connection must be closed. All native calls live in `rtc`.

use std::collections::VecDeque;

use crate::error::{SignalError, SignalResult};
use crate::protocol::{IceCandidate, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    New,
    OfferCreated,
    OfferReceived,
    AnswerPending,
    AnswerCreated,
    Established,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceGatheringState {
    New,
    Gathering,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Connected,
    Disconnected,
    Closed,
}

#[derive(Debug)]
pub struct NegotiationSession {
    state: NegotiationState,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    pending_local: VecDeque<IceCandidate>,
    pending_remote: Vec<IceCandidate>,
    addressable: bool,
    flush_deferred: bool,
    close_requested: bool,
}

impl NegotiationSession {
    /// `addressable` is true when the connection id is already known, which is
    /// the case for connections created from a remote offer.
    pub fn new(addressable: bool) -> Self {
        Self {
            state: NegotiationState::New,
            local_description: None,
            remote_description: None,
            pending_local: VecDeque::new(),
            pending_remote: Vec::new(),
            addressable,
            flush_deferred: false,
            close_requested: false,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    #[cfg(test)]
    fn pending_local_candidates(&self) -> usize {
        self.pending_local.len()
    }

    pub fn offer_created(&mut self, offer: SessionDescription) -> SignalResult<()> {
        self.transition(NegotiationState::New, NegotiationState::OfferCreated, "create an offer")?;
        self.local_description = Some(offer);
        Ok(())
    }

    pub fn offer_sent(&mut self) -> SignalResult<()> {
        self.transition(
            NegotiationState::OfferCreated,
            NegotiationState::AnswerPending,
            "send an offer",
        )
    }

    /// Records the remote answer and hands back remote candidates that
    /// arrived before it, in arrival order.
    pub fn answer_received(&mut self, answer: SessionDescription) -> SignalResult<Vec<IceCandidate>> {
        self.transition(
            NegotiationState::AnswerPending,
            NegotiationState::Established,
            "apply an answer",
        )?;
        self.remote_description = Some(answer);
        Ok(std::mem::take(&mut self.pending_remote))
    }

    /// Records the remote offer and hands back remote candidates that arrived
    /// before it, in arrival order.
    pub fn offer_received(&mut self, offer: SessionDescription) -> SignalResult<Vec<IceCandidate>> {
        self.transition(NegotiationState::New, NegotiationState::OfferReceived, "apply an offer")?;
        self.remote_description = Some(offer);
        Ok(std::mem::take(&mut self.pending_remote))
    }

    pub fn answer_created(&mut self, answer: SessionDescription) -> SignalResult<()> {
        self.transition(
            NegotiationState::OfferReceived,
            NegotiationState::AnswerCreated,
            "create an answer",
        )?;
        self.local_description = Some(answer);
        Ok(())
    }

    pub fn answer_sent(&mut self) -> SignalResult<()> {
        self.transition(
            NegotiationState::AnswerCreated,
            NegotiationState::Established,
            "send an answer",
        )
    }

    pub fn buffer_local_candidate(&mut self, candidate: IceCandidate) {
        if self.state == NegotiationState::Closed {
            return;
        }
        self.pending_local.push_back(candidate);
    }

    /// Remote candidates can only be applied after a remote description.
    /// Returns the candidate back when it can be applied right away.
    pub fn accept_remote_candidate(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.state == NegotiationState::Closed {
            return None;
        }
        if self.remote_description.is_some() {
            Some(candidate)
        } else {
            self.pending_remote.push(candidate);
            None
        }
    }

    /// Candidates to transmit, oldest first. Gathering `Complete` drains the
    /// local buffer (or defers the drain until the connection id is known);
    /// gathering `New` discards it.
    pub fn gathering_changed(&mut self, state: IceGatheringState) -> Vec<IceCandidate> {
        match state {
            IceGatheringState::New => {
                self.pending_local.clear();
                self.flush_deferred = false;
                Vec::new()
            }
            IceGatheringState::Gathering => Vec::new(),
            IceGatheringState::Complete if self.addressable => self.pending_local.drain(..).collect(),
            IceGatheringState::Complete => {
                self.flush_deferred = true;
                Vec::new()
            }
        }
    }

    /// The connection id became known; releases a deferred flush.
    pub fn mark_addressable(&mut self) -> Vec<IceCandidate> {
        self.addressable = true;
        if std::mem::take(&mut self.flush_deferred) {
            self.pending_local.drain(..).collect()
        } else {
            Vec::new()
        }
    }

    /// Returns true exactly once, when ICE loss means the connection has to
    /// be closed.
    pub fn ice_connection_changed(&mut self, state: IceConnectionState) -> bool {
        if state == IceConnectionState::Disconnected && !self.close_requested {
            self.close_requested = true;
            return self.state != NegotiationState::Closed;
        }
        false
    }

    pub fn close(&mut self) {
        self.state = NegotiationState::Closed;
        self.pending_local.clear();
        self.pending_remote.clear();
        self.flush_deferred = false;
    }

    fn transition(
        &mut self,
        from: NegotiationState,
        to: NegotiationState,
        action: &str,
    ) -> SignalResult<()> {
        if self.state != from {
            return Err(SignalError::Negotiation(format!(
                "cannot {action} while {:?}",
                self.state
            )));
        }
        self.state = to;
        Ok(())
    }
}
