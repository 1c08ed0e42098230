#![forbid(unsafe_code)]

// Signaling protocol - Message types for WebSocket communication

use crate::error::{ErrorKind, SignalingError};
use crate::media::types::{
    ConnectionId, ConsumerId, ConsumerInfo, Direction, LectureId, MediaKind, ProducerId,
    TrackSource, TransportId, TransportInfo, UserId,
};
use crate::room::peer::Role;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Pre-validated identity attached to a connection by the upstream gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: UserId,
    pub role: Role,
    pub display_name: String,
}

/// Client-to-Server frame: an operation plus an optional ack id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
    #[serde(flatten)]
    pub request: ClientRequest,
}

/// Client-to-Server operations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientRequest {
    /// Open the live room for a lecture (host only)
    #[serde(rename_all = "camelCase")]
    CreateRoom { lecture_id: LectureId },
    #[serde(rename_all = "camelCase")]
    JoinRoom { lecture_id: LectureId },
    #[serde(rename_all = "camelCase")]
    LeaveRoom {
        #[serde(default)]
        lecture_id: Option<LectureId>,
    },
    /// End the lecture for everyone (host only)
    #[serde(rename_all = "camelCase")]
    EndLecture {
        #[serde(default)]
        lecture_id: Option<LectureId>,
    },
    #[serde(rename_all = "camelCase")]
    GetRouterCapabilities {
        #[serde(default)]
        lecture_id: Option<LectureId>,
    },
    #[serde(rename_all = "camelCase")]
    CreateTransport {
        #[serde(default)]
        lecture_id: Option<LectureId>,
        direction: Direction,
    },
    /// Complete the network handshake (DTLS parameters)
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        #[serde(default)]
        lecture_id: Option<LectureId>,
        transport_id: TransportId,
        #[serde(alias = "dtlsParameters")]
        handshake_parameters: Value,
    },
    #[serde(rename_all = "camelCase")]
    Produce {
        #[serde(default)]
        lecture_id: Option<LectureId>,
        transport_id: TransportId,
        kind: MediaKind,
        #[serde(alias = "rtpParameters")]
        media_parameters: Value,
        #[serde(default)]
        source: Option<TrackSource>,
        #[serde(default)]
        metadata: Value,
    },
    #[serde(rename_all = "camelCase")]
    GetProducers {
        #[serde(default)]
        lecture_id: Option<LectureId>,
    },
    #[serde(rename_all = "camelCase")]
    Consume {
        #[serde(default)]
        lecture_id: Option<LectureId>,
        producer_id: ProducerId,
        transport_id: TransportId,
        #[serde(alias = "rtpCapabilities")]
        remote_capabilities: Value,
    },
    /// Pause an own producer (mute)
    #[serde(rename_all = "camelCase")]
    PauseProduce {
        #[serde(default)]
        lecture_id: Option<LectureId>,
        producer_id: ProducerId,
    },
    /// Resume an own producer (unmute)
    #[serde(rename_all = "camelCase")]
    ResumeProduce {
        #[serde(default)]
        lecture_id: Option<LectureId>,
        producer_id: ProducerId,
    },
    #[serde(rename_all = "camelCase")]
    CloseProducer {
        #[serde(default)]
        lecture_id: Option<LectureId>,
        #[serde(alias = "producerId")]
        id: ProducerId,
    },
    #[serde(rename_all = "camelCase")]
    CloseConsumer {
        #[serde(default)]
        lecture_id: Option<LectureId>,
        #[serde(alias = "consumerId")]
        id: ConsumerId,
    },
    #[serde(rename_all = "camelCase")]
    PauseConsumer {
        #[serde(default)]
        lecture_id: Option<LectureId>,
        consumer_id: ConsumerId,
    },
    #[serde(rename_all = "camelCase")]
    ResumeConsumer {
        #[serde(default)]
        lecture_id: Option<LectureId>,
        consumer_id: ConsumerId,
    },
    /// Chat relay to the rest of the room
    #[serde(rename_all = "camelCase")]
    SendMessage {
        #[serde(default)]
        lecture_id: Option<LectureId>,
        text: String,
    },
}

impl ClientRequest {
    /// Operation name as it appears on the wire
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateRoom { .. } => "create-room",
            Self::JoinRoom { .. } => "join-room",
            Self::LeaveRoom { .. } => "leave-room",
            Self::EndLecture { .. } => "end-lecture",
            Self::GetRouterCapabilities { .. } => "get-router-capabilities",
            Self::CreateTransport { .. } => "create-transport",
            Self::ConnectTransport { .. } => "connect-transport",
            Self::Produce { .. } => "produce",
            Self::GetProducers { .. } => "get-producers",
            Self::Consume { .. } => "consume",
            Self::PauseProduce { .. } => "pause-produce",
            Self::ResumeProduce { .. } => "resume-produce",
            Self::CloseProducer { .. } => "close-producer",
            Self::CloseConsumer { .. } => "close-consumer",
            Self::PauseConsumer { .. } => "pause-consumer",
            Self::ResumeConsumer { .. } => "resume-consumer",
            Self::SendMessage { .. } => "send-message",
        }
    }
}

/// Operation-specific part of a successful ack
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SignalingResponse {
    #[serde(rename_all = "camelCase")]
    RouterCapabilities { router_capabilities: Value },
    #[serde(rename_all = "camelCase")]
    Transport {
        #[serde(flatten)]
        info: TransportInfo,
        direction: Direction,
    },
    Produced { id: ProducerId },
    Producers { producers: Vec<ProducerSummary> },
    Consumed { params: ConsumerInfo },
    #[serde(rename_all = "camelCase")]
    ProducerState { producer_id: ProducerId },
    #[serde(rename_all = "camelCase")]
    ConsumerState { consumer_id: ConsumerId },
}

/// Reply to a client frame that carried an ack id
#[derive(Debug, Clone, Serialize)]
pub struct AckFrame {
    #[serde(rename = "type")]
    kind: &'static str,
    pub ack: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorKind>,
    #[serde(flatten)]
    pub response: Option<SignalingResponse>,
}

impl AckFrame {
    pub fn ok(ack: u64, response: Option<SignalingResponse>) -> Self {
        Self {
            kind: "ack",
            ack,
            success: true,
            message: None,
            code: None,
            response,
        }
    }

    pub fn err(ack: u64, error: &SignalingError) -> Self {
        Self {
            kind: "ack",
            ack,
            success: false,
            message: Some(error.to_string()),
            code: Some(error.kind()),
            response: None,
        }
    }
}

/// A published track as seen by other peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerSummary {
    pub producer_id: ProducerId,
    pub peer_id: ConnectionId,
    pub user_id: UserId,
    pub kind: MediaKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<TrackSource>,
    pub metadata: Value,
    pub paused: bool,
}

/// Server-to-Client events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Another peer published a track
    NewProducer(ProducerSummary),
    #[serde(rename_all = "camelCase")]
    ProducerPaused { producer_id: ProducerId },
    #[serde(rename_all = "camelCase")]
    ProducerResumed { producer_id: ProducerId },
    #[serde(rename_all = "camelCase")]
    ProducerClosed { producer_id: ProducerId },
    /// One of the recipient's consumers was closed without it asking
    #[serde(rename_all = "camelCase")]
    ConsumerClosed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },
    #[serde(rename_all = "camelCase")]
    NewUserJoined {
        peer_id: ConnectionId,
        user_id: UserId,
        display_name: String,
        role: Role,
    },
    #[serde(rename_all = "camelCase")]
    PeerLeft {
        peer_id: ConnectionId,
        user_id: UserId,
        display_name: String,
    },
    #[serde(rename_all = "camelCase")]
    LectureEnded { lecture_id: LectureId },
    /// Chat message from another peer
    #[serde(rename_all = "camelCase")]
    ReceiveMessage {
        text: String,
        sender_id: UserId,
        sender_name: String,
    },
    /// This connection was evicted by a newer one for the same user
    #[serde(rename_all = "camelCase")]
    SessionReplaced { lecture_id: LectureId },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<ErrorKind>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_frame_with_ack() {
        let frame: ClientFrame = serde_json::from_value(json!({
            "type": "create-transport",
            "ack": 7,
            "lectureId": "L1",
            "direction": "publish"
        }))
        .unwrap();
        assert_eq!(frame.ack, Some(7));
        match frame.request {
            ClientRequest::CreateTransport { lecture_id, direction } => {
                assert_eq!(lecture_id, Some(LectureId::new("L1")));
                assert_eq!(direction, Direction::Send);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_parse_fire_and_forget() {
        let frame: ClientFrame = serde_json::from_value(json!({
            "type": "send-message",
            "lectureId": "L1",
            "text": "hello"
        }))
        .unwrap();
        assert!(frame.ack.is_none());
        assert_eq!(frame.request.name(), "send-message");
    }

    #[test]
    fn test_parse_produce_with_mediasoup_field_names() {
        let frame: ClientFrame = serde_json::from_value(json!({
            "type": "produce",
            "ack": 1,
            "transportId": "t-1",
            "kind": "video",
            "rtpParameters": { "codecs": [] },
            "source": "screen",
            "metadata": { "label": "slides" }
        }))
        .unwrap();
        match frame.request {
            ClientRequest::Produce { kind, source, media_parameters, metadata, .. } => {
                assert_eq!(kind, MediaKind::Video);
                assert_eq!(source, Some(TrackSource::Screen));
                assert!(media_parameters.is_object());
                assert_eq!(metadata["label"], "slides");
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let result = serde_json::from_value::<ClientFrame>(json!({ "type": "teleport" }));
        assert!(result.is_err());
    }

    #[test]
    fn test_ack_success_flattens_response() {
        let ack = AckFrame::ok(
            3,
            Some(SignalingResponse::ProducerState {
                producer_id: ProducerId::new("p-1"),
            }),
        );
        let json = serde_json::to_value(ack).unwrap();
        assert_eq!(
            json,
            json!({ "type": "ack", "ack": 3, "success": true, "producerId": "p-1" })
        );
    }

    #[test]
    fn test_ack_failure_carries_message_and_code() {
        let err = SignalingError::RoomNotFound(LectureId::new("L9"));
        let json = serde_json::to_value(AckFrame::err(4, &err)).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["code"], "not-found");
        assert_eq!(json["message"], "Room not found for lecture L9");
    }

    #[test]
    fn test_transport_response_shape() {
        let response = SignalingResponse::Transport {
            info: TransportInfo {
                id: TransportId::new("t-1"),
                handshake_params: json!({ "iceCandidates": [] }),
            },
            direction: Direction::Recv,
        };
        let json = serde_json::to_value(AckFrame::ok(1, Some(response))).unwrap();
        assert_eq!(json["id"], "t-1");
        assert_eq!(json["direction"], "recv");
        assert!(json["handshakeParams"]["iceCandidates"].is_array());
    }

    #[test]
    fn test_server_message_names() {
        let msg = ServerMessage::LectureEnded {
            lecture_id: LectureId::new("L1"),
        };
        assert_eq!(
            serde_json::to_value(msg).unwrap(),
            json!({ "type": "lecture-ended", "lectureId": "L1" })
        );

        let msg = ServerMessage::ReceiveMessage {
            text: "hi".into(),
            sender_id: UserId::new("u-1"),
            sender_name: "Ada".into(),
        };
        let json = serde_json::to_value(msg).unwrap();
        assert_eq!(json["type"], "receive-message");
        assert_eq!(json["senderName"], "Ada");
    }

    #[test]
    fn test_new_producer_is_flat() {
        let msg = ServerMessage::NewProducer(ProducerSummary {
            producer_id: ProducerId::new("p-1"),
            peer_id: ConnectionId::new("c-1"),
            user_id: UserId::new("u-1"),
            kind: MediaKind::Audio,
            source: Some(TrackSource::Microphone),
            metadata: json!({}),
            paused: false,
        });
        let json = serde_json::to_value(msg).unwrap();
        assert_eq!(json["type"], "new-producer");
        assert_eq!(json["producerId"], "p-1");
        assert_eq!(json["source"], "microphone");
    }
}
