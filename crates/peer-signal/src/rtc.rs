//! Binding between the negotiation layer and `webrtc`.
//!
//! Native callbacks are collapsed into [`PeerEvent`]s tagged with the
//! connection they belong to, so the connection manager can process them on
//! its own task.

use std::sync::{Arc, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;

use crate::channel::DataChannelMultiplexer;
use crate::error::{SignalError, SignalResult};
use crate::media::{RemoteTrackInfo, TrackKind};
use crate::negotiation::{IceConnectionState, IceGatheringState};
use crate::protocol::{IceCandidate, SdpType, SessionDescription};

/// Arena key of a connection inside the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ConnectionKey(pub(crate) u64);

pub(crate) struct PeerEvent {
    pub key: ConnectionKey,
    pub kind: PeerEventKind,
}

pub(crate) enum PeerEventKind {
    LocalCandidate(IceCandidate),
    GatheringChanged(IceGatheringState),
    IceConnectionChanged(IceConnectionState),
    DataChannel(Arc<RTCDataChannel>),
    TrackAdded(RemoteTrackInfo),
}

/// Owns the `webrtc` API object every peer connection is created from.
pub(crate) struct RtcFactory {
    api: API,
    configuration: RTCConfiguration,
}

impl RtcFactory {
    /// `include_loopback` also offers loopback host candidates, which lets
    /// two peers on the same host connect without any other interface.
    pub fn new(ice_servers: &[String], include_loopback: bool) -> SignalResult<Self> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let mut setting = SettingEngine::default();
        setting.set_include_loopback_candidate(include_loopback);
        let api = APIBuilder::new()
            .with_setting_engine(setting)
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }]
        };
        Ok(Self {
            api,
            configuration: RTCConfiguration {
                ice_servers,
                ..Default::default()
            },
        })
    }

    /// Data channels opened by the remote side are bound to `mux` before
    /// they can deliver anything; without a multiplexer they are only
    /// reported.
    pub async fn create(
        &self,
        key: ConnectionKey,
        events: mpsc::UnboundedSender<PeerEvent>,
        mux: Option<DataChannelMultiplexer>,
    ) -> SignalResult<Arc<RTCPeerConnection>> {
        let pc = Arc::new(self.api.new_peer_connection(self.configuration.clone()).await?);
        install_handlers(&pc, key, events, mux);
        Ok(pc)
    }
}

fn install_handlers(
    pc: &RTCPeerConnection,
    key: ConnectionKey,
    events: mpsc::UnboundedSender<PeerEvent>,
    mux: Option<DataChannelMultiplexer>,
) {
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let kind = match candidate {
            Some(candidate) => match local_candidate(&candidate) {
                Ok(candidate) => Some(PeerEventKind::LocalCandidate(candidate)),
                Err(err) => {
                    tracing::debug!(target = "rtc", error = %err, "skipping unusable local candidate");
                    None
                }
            },
            // End of candidates.
            None => Some(PeerEventKind::GatheringChanged(IceGatheringState::Complete)),
        };
        if let Some(kind) = kind {
            let _ = tx.send(PeerEvent { key, kind });
        }
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
        let mapped = match state {
            RTCIceGathererState::New => Some(IceGatheringState::New),
            RTCIceGathererState::Gathering => Some(IceGatheringState::Gathering),
            RTCIceGathererState::Complete => Some(IceGatheringState::Complete),
            _ => None,
        };
        if let Some(state) = mapped {
            let _ = tx.send(PeerEvent {
                key,
                kind: PeerEventKind::GatheringChanged(state),
            });
        }
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        tracing::debug!(target = "rtc", key = key.0, ?state, "ice connection state");
        let _ = tx.send(PeerEvent {
            key,
            kind: PeerEventKind::IceConnectionChanged(ice_connection_state(state)),
        });
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        // Runs before the channel opens, so no message can slip past.
        if let Some(mux) = &mux {
            bind_data_channel(&dc, mux.clone());
        }
        let _ = tx.send(PeerEvent {
            key,
            kind: PeerEventKind::DataChannel(dc),
        });
        Box::pin(async {})
    }));

    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
            let kind = match track.kind() {
                RTPCodecType::Audio => Some(TrackKind::Audio),
                RTPCodecType::Video => Some(TrackKind::Video),
                _ => None,
            };
            if let Some(kind) = kind {
                let _ = events.send(PeerEvent {
                    key,
                    kind: PeerEventKind::TrackAdded(RemoteTrackInfo {
                        track_id: track.id(),
                        stream_id: track.stream_id(),
                        kind,
                    }),
                });
            }
            Box::pin(async {})
        },
    ));
}

pub(crate) fn ice_connection_state(state: RTCIceConnectionState) -> IceConnectionState {
    match state {
        RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
            IceConnectionState::Connected
        }
        RTCIceConnectionState::Disconnected | RTCIceConnectionState::Failed => {
            IceConnectionState::Disconnected
        }
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => IceConnectionState::New,
    }
}

fn local_candidate(candidate: &RTCIceCandidate) -> SignalResult<IceCandidate> {
    let init = candidate.to_json()?;
    match (init.sdp_mid, init.sdp_mline_index) {
        (Some(sdp_mid), Some(sdp_mline_index)) => Ok(IceCandidate {
            sdp_mid,
            sdp_mline_index,
            candidate: init.candidate,
        }),
        _ => Err(SignalError::Negotiation(
            "local candidate without media section".into(),
        )),
    }
}

fn candidate_init(candidate: &IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate.clone(),
        sdp_mid: Some(candidate.sdp_mid.clone()),
        sdp_mline_index: Some(candidate.sdp_mline_index),
        username_fragment: None,
    }
}

pub(crate) fn to_rtc_description(description: &SessionDescription) -> SignalResult<RTCSessionDescription> {
    let sdp = description.sdp.clone();
    let converted = match description.kind {
        SdpType::Offer => RTCSessionDescription::offer(sdp),
        SdpType::Answer => RTCSessionDescription::answer(sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(sdp),
        SdpType::Rollback => {
            return Err(SignalError::Negotiation(
                "rollback descriptions are not supported".into(),
            ))
        }
    };
    Ok(converted?)
}

pub(crate) fn from_rtc_description(description: &RTCSessionDescription) -> SignalResult<SessionDescription> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(SignalError::Negotiation("unspecified description type".into()))
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: description.sdp.clone(),
    })
}

pub(crate) async fn create_offer(pc: &RTCPeerConnection) -> SignalResult<SessionDescription> {
    let offer = pc.create_offer(None).await?;
    pc.set_local_description(offer.clone()).await?;
    from_rtc_description(&offer)
}

pub(crate) async fn answer_offer(
    pc: &RTCPeerConnection,
    offer: &SessionDescription,
) -> SignalResult<SessionDescription> {
    pc.set_remote_description(to_rtc_description(offer)?).await?;
    let answer = pc.create_answer(None).await?;
    pc.set_local_description(answer.clone()).await?;
    from_rtc_description(&answer)
}

pub(crate) async fn apply_answer(pc: &RTCPeerConnection, answer: &SessionDescription) -> SignalResult<()> {
    pc.set_remote_description(to_rtc_description(answer)?).await?;
    Ok(())
}

pub(crate) async fn add_candidate(pc: &RTCPeerConnection, candidate: &IceCandidate) -> SignalResult<()> {
    pc.add_ice_candidate(candidate_init(candidate)).await?;
    Ok(())
}

pub(crate) async fn open_data_channel(
    pc: &RTCPeerConnection,
    label: &str,
) -> SignalResult<Arc<RTCDataChannel>> {
    let init = RTCDataChannelInit {
        ordered: Some(true),
        ..Default::default()
    };
    Ok(pc.create_data_channel(label, Some(init)).await?)
}

/// Receive-only audio and video sections for calls placed without local media.
pub(crate) async fn add_receive_transceivers(pc: &RTCPeerConnection) -> SignalResult<()> {
    for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
        pc.add_transceiver_from_kind(
            kind,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: Vec::new(),
            }),
        )
        .await?;
    }
    Ok(())
}

/// Wires a native data channel into the multiplexer. Text messages flow
/// both ways; binary messages are refused.
pub(crate) fn bind_data_channel(dc: &Arc<RTCDataChannel>, mux: DataChannelMultiplexer) {
    let weak = Arc::downgrade(dc);
    let open_mux = mux.clone();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            let Some(dc) = weak.upgrade() else {
                return;
            };
            let id = dc.id();
            match open_mux.open(id, dc.label()) {
                Some(outgoing) => {
                    tracing::debug!(target = "rtc", channel = id, label = dc.label(), "exchange channel open");
                    spawn_outgoing_relay(dc, outgoing);
                }
                None => tracing::debug!(target = "rtc", channel = id, "exchange channel not announced"),
            }
        })
    }));

    let weak: Weak<RTCDataChannel> = Arc::downgrade(dc);
    let message_mux = mux.clone();
    dc.on_message(Box::new(move |message: DataChannelMessage| {
        let id = weak.upgrade().map(|dc| dc.id());
        let mux = message_mux.clone();
        Box::pin(async move {
            let Some(id) = id else {
                return;
            };
            if !message.is_string {
                tracing::warn!(target = "rtc", channel = id, len = message.data.len(), "binary messages are not supported");
                return;
            }
            match String::from_utf8(message.data.to_vec()) {
                Ok(text) => {
                    if !mux.deliver(id, text) {
                        tracing::debug!(target = "rtc", channel = id, "message for a channel nobody holds");
                    }
                }
                Err(err) => tracing::warn!(target = "rtc", channel = id, error = %err, "invalid utf-8 text message"),
            }
        })
    }));

    let weak = Arc::downgrade(dc);
    dc.on_close(Box::new(move || {
        if let Some(dc) = weak.upgrade() {
            tracing::debug!(target = "rtc", channel = dc.id(), "exchange channel closed");
            mux.closed(dc.id());
        }
        Box::pin(async {})
    }));
}

fn spawn_outgoing_relay(dc: Arc<RTCDataChannel>, mut outgoing: mpsc::Receiver<String>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(text) = outgoing.recv().await {
            if let Err(err) = dc.send_text(text).await {
                tracing::warn!(target = "rtc", channel = dc.id(), error = %err, "exchange channel send failed");
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ice_states_collapse_onto_four() {
        assert_eq!(
            ice_connection_state(RTCIceConnectionState::Checking),
            IceConnectionState::New
        );
        assert_eq!(
            ice_connection_state(RTCIceConnectionState::Completed),
            IceConnectionState::Connected
        );
        assert_eq!(
            ice_connection_state(RTCIceConnectionState::Failed),
            IceConnectionState::Disconnected
        );
        assert_eq!(
            ice_connection_state(RTCIceConnectionState::Closed),
            IceConnectionState::Closed
        );
    }

    #[test]
    fn rollback_cannot_be_applied() {
        let rollback = SessionDescription {
            kind: SdpType::Rollback,
            sdp: String::new(),
        };
        assert!(to_rtc_description(&rollback).is_err());
    }

    #[test]
    fn candidate_init_keeps_every_field() {
        let init = candidate_init(&IceCandidate {
            sdp_mid: "1".into(),
            sdp_mline_index: 1,
            candidate: "candidate:7 1 udp 1 10.0.0.1 9 typ host".into(),
        });
        assert_eq!(init.sdp_mid.as_deref(), Some("1"));
        assert_eq!(init.sdp_mline_index, Some(1));
        assert!(init.username_fragment.is_none());
    }

    #[tokio::test]
    async fn local_offer_round_trips_through_the_wire_type() {
        let factory = RtcFactory::new(&[], false).expect("factory");
        let (tx, _rx) = mpsc::unbounded_channel();
        let pc = factory.create(ConnectionKey(1), tx, None).await.expect("peer connection");
        open_data_channel(&pc, "steps").await.expect("data channel");

        let offer = create_offer(&pc).await.expect("offer");
        assert_eq!(offer.kind, SdpType::Offer);
        assert!(offer.sdp.contains("webrtc-datachannel"));
        assert!(to_rtc_description(&offer).is_ok());

        pc.close().await.expect("close");
    }
}
