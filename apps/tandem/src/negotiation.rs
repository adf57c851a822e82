//! Perfect negotiation over a [`PeerConnection`].
//!
//! Each side has a fixed role. When both sides offer at once the impolite
//! side drops the incoming offer and keeps its own, while the polite side
//! rolls its offer back and answers. The engine never owns the connection;
//! the session hands it in on every call so that a rebuilt connection can be
//! driven by a fresh engine.

use async_trait::async_trait;
use tandem_proto::{ClientFrame, IceCandidate, SessionDescription, Signal};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::transport::{PeerConnection, SignalingState, TransportError};

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("connection has no local description after applying one")]
    MissingLocalDescription,
    #[error("signaling channel closed")]
    SignalClosed,
    #[error("failed to encode signal: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Where this side stands in the offer/answer exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    Stable,
    /// Creating and applying a local offer.
    MakingOffer,
    /// Local offer sent, waiting for the answer.
    AwaitingAnswer,
    /// The last remote offer collided with ours and was dropped.
    IgnoringOffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptionOutcome {
    Ignored,
    AppliedAnswer,
    AnsweredOffer { rolled_back: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    Added,
    /// Failed while ignoring an offer, or the candidate was an empty marker.
    Suppressed,
}

/// Outbound half of the signaling path.
#[async_trait]
pub trait SignalSink: Send + Sync {
    async fn send_signal(&self, signal: Signal) -> Result<(), NegotiationError>;
}

/// Sends signals as relay frames, addressed to `recipient` in mesh rooms.
#[derive(Debug, Clone)]
pub struct RelaySignalSink {
    frames: mpsc::UnboundedSender<ClientFrame>,
    recipient: Option<String>,
}

impl RelaySignalSink {
    pub fn new(frames: mpsc::UnboundedSender<ClientFrame>, recipient: Option<String>) -> Self {
        Self { frames, recipient }
    }
}

#[async_trait]
impl SignalSink for RelaySignalSink {
    async fn send_signal(&self, signal: Signal) -> Result<(), NegotiationError> {
        let frame = ClientFrame::Signal {
            recipient: self.recipient.clone(),
            payload: signal.to_value()?,
        };
        self.frames
            .send(frame)
            .map_err(|_| NegotiationError::SignalClosed)
    }
}

#[derive(Debug)]
pub struct NegotiationEngine {
    polite: bool,
    phase: NegotiationPhase,
}

impl NegotiationEngine {
    pub fn new(polite: bool) -> Self {
        Self {
            polite,
            phase: NegotiationPhase::Stable,
        }
    }

    pub fn polite(&self) -> bool {
        self.polite
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    /// Creates, applies and sends a local offer. Returns false when an offer
    /// is already in flight or the connection is mid-exchange.
    pub async fn on_negotiation_needed(
        &mut self,
        pc: &dyn PeerConnection,
        signals: &dyn SignalSink,
    ) -> Result<bool, NegotiationError> {
        if self.phase == NegotiationPhase::MakingOffer
            || pc.signaling_state() != SignalingState::Stable
        {
            debug!(
                target: "tandem::negotiation",
                phase = ?self.phase,
                signaling = ?pc.signaling_state(),
                "negotiation needed while busy; skipping"
            );
            return Ok(false);
        }

        self.phase = NegotiationPhase::MakingOffer;
        let result = make_offer(pc, signals).await;
        // Leave making-offer whether or not the send succeeded.
        self.settle(pc);
        result.map(|()| true)
    }

    pub async fn on_remote_description(
        &mut self,
        pc: &dyn PeerConnection,
        signals: &dyn SignalSink,
        description: SessionDescription,
    ) -> Result<DescriptionOutcome, NegotiationError> {
        let ready_for_offer = self.phase != NegotiationPhase::MakingOffer
            && pc.signaling_state() == SignalingState::Stable;
        let offer_collision = description.is_offer() && !ready_for_offer;

        if offer_collision && !self.polite {
            self.phase = NegotiationPhase::IgnoringOffer;
            debug!(target: "tandem::negotiation", "ignoring colliding offer");
            return Ok(DescriptionOutcome::Ignored);
        }

        let result = self
            .apply_remote(pc, signals, description, offer_collision)
            .await;
        self.settle(pc);
        result
    }

    async fn apply_remote(
        &mut self,
        pc: &dyn PeerConnection,
        signals: &dyn SignalSink,
        description: SessionDescription,
        offer_collision: bool,
    ) -> Result<DescriptionOutcome, NegotiationError> {
        if offer_collision {
            debug!(target: "tandem::negotiation", "rolling back local offer for remote offer");
            pc.rollback().await?;
        }

        let is_offer = description.is_offer();
        pc.set_remote_description(description).await?;
        if !is_offer {
            trace!(target: "tandem::negotiation", "remote answer applied");
            return Ok(DescriptionOutcome::AppliedAnswer);
        }

        let answer = pc.create_answer().await?;
        pc.set_local_description(answer).await?;
        let description = pc
            .local_description()
            .await
            .ok_or(NegotiationError::MissingLocalDescription)?;
        signals
            .send_signal(Signal::Description { description })
            .await?;
        Ok(DescriptionOutcome::AnsweredOffer {
            rolled_back: offer_collision,
        })
    }

    pub async fn on_remote_candidate(
        &self,
        pc: &dyn PeerConnection,
        candidate: IceCandidate,
    ) -> Result<CandidateOutcome, NegotiationError> {
        let trivial = candidate.is_trivial();
        match pc.add_ice_candidate(candidate).await {
            Ok(()) => Ok(CandidateOutcome::Added),
            Err(err) if self.phase == NegotiationPhase::IgnoringOffer || trivial => {
                debug!(target: "tandem::negotiation", "candidate dropped: {err}");
                Ok(CandidateOutcome::Suppressed)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn on_local_candidate(
        &self,
        signals: &dyn SignalSink,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError> {
        signals.send_signal(Signal::Candidate { candidate }).await
    }

    /// A peer joined after us: we become impolite, and an offer made before
    /// anyone was listening is sent again.
    pub async fn on_peer_joined(
        &mut self,
        pc: &dyn PeerConnection,
        signals: &dyn SignalSink,
    ) -> Result<bool, NegotiationError> {
        self.polite = false;
        if pc.signaling_state() != SignalingState::HaveLocalOffer {
            return Ok(false);
        }
        let Some(description) = pc.local_description().await else {
            return Ok(false);
        };
        debug!(target: "tandem::negotiation", "resending pending offer to new peer");
        signals
            .send_signal(Signal::Description { description })
            .await?;
        Ok(true)
    }

    fn settle(&mut self, pc: &dyn PeerConnection) {
        self.phase = match pc.signaling_state() {
            SignalingState::HaveLocalOffer => NegotiationPhase::AwaitingAnswer,
            _ => NegotiationPhase::Stable,
        };
    }
}

async fn make_offer(
    pc: &dyn PeerConnection,
    signals: &dyn SignalSink,
) -> Result<(), NegotiationError> {
    let offer = pc.create_offer().await?;
    pc.set_local_description(offer).await?;
    let description = pc
        .local_description()
        .await
        .ok_or(NegotiationError::MissingLocalDescription)?;
    signals
        .send_signal(Signal::Description { description })
        .await
}
