#![forbid(unsafe_code)]

// Configuration for mediasoup workers, routers, and transports

use crate::config::{lookup_parsed, Lookup};
use ::mediasoup::prelude::*;
use ::mediasoup::worker::{WorkerLogLevel, WorkerLogTag};
use std::net::{IpAddr, Ipv4Addr};
use std::num::{NonZeroU32, NonZeroU8};

/// Settings for the mediasoup-backed engine
#[derive(Debug, Clone)]
pub struct MediasoupConfig {
    pub num_workers: usize,
    pub log_level: WorkerLogLevel,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    /// First UDP port of the per-worker WebRtcServers (worker i listens on base + i)
    pub webrtc_server_port_base: u16,
    /// Address advertised in ICE candidates
    pub announced_ip: IpAddr,
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for MediasoupConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get(),
            log_level: WorkerLogLevel::Warn,
            rtc_min_port: 10000,
            rtc_max_port: 59999,
            webrtc_server_port_base: 40000,
            announced_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            media_codecs: default_codecs(),
        }
    }
}

impl MediasoupConfig {
    /// Reads `MEDIA_WORKERS`, `RTC_MIN_PORT`, `RTC_MAX_PORT`,
    /// `WEBRTC_SERVER_PORT` and `ANNOUNCE_IP`
    pub fn from_lookup(lookup: &Lookup<'_>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let num_workers = lookup_parsed(lookup, "MEDIA_WORKERS", defaults.num_workers)?.max(1);
        let rtc_min_port = lookup_parsed(lookup, "RTC_MIN_PORT", defaults.rtc_min_port)?;
        let rtc_max_port = lookup_parsed(lookup, "RTC_MAX_PORT", defaults.rtc_max_port)?;
        if rtc_min_port > rtc_max_port {
            anyhow::bail!("RTC_MIN_PORT ({rtc_min_port}) is above RTC_MAX_PORT ({rtc_max_port})");
        }
        Ok(Self {
            num_workers,
            rtc_min_port,
            rtc_max_port,
            webrtc_server_port_base: lookup_parsed(
                lookup,
                "WEBRTC_SERVER_PORT",
                defaults.webrtc_server_port_base,
            )?,
            announced_ip: lookup_parsed(lookup, "ANNOUNCE_IP", defaults.announced_ip)?,
            ..defaults
        })
    }

    /// Converts to mediasoup WorkerSettings
    pub fn to_worker_settings(&self) -> WorkerSettings {
        let mut settings = WorkerSettings::default();
        settings.log_level = self.log_level;
        settings.log_tags = vec![
            WorkerLogTag::Info,
            WorkerLogTag::Ice,
            WorkerLogTag::Dtls,
            WorkerLogTag::Rtp,
            WorkerLogTag::Rtcp,
        ];
        settings.rtc_port_range = self.rtc_min_port..=self.rtc_max_port;
        settings
    }

    /// Listen info for the WebRtcServer of worker `index`
    pub fn server_listen_info(&self, index: usize) -> ListenInfo {
        ListenInfo {
            protocol: Protocol::Udp,
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_address: Some(self.announced_ip.to_string()),
            port: Some(self.webrtc_server_port_base + index as u16),
            port_range: None,
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
            expose_internal_ip: false,
        }
    }
}

/// Opus audio plus VP8/VP9/H264 video
pub fn default_codecs() -> Vec<RtpCodecCapability> {
    let video_feedback = || {
        vec![
            RtcpFeedback::Nack,
            RtcpFeedback::NackPli,
            RtcpFeedback::CcmFir,
            RtcpFeedback::GoogRemb,
            RtcpFeedback::TransportCc,
        ]
    };
    let video_clock = NonZeroU32::new(90000).unwrap_or(NonZeroU32::MIN);

    vec![
        RtpCodecCapability::Audio {
            mime_type: MimeTypeAudio::Opus,
            preferred_payload_type: Some(111),
            clock_rate: NonZeroU32::new(48000).unwrap_or(NonZeroU32::MIN),
            channels: NonZeroU8::new(2).unwrap_or(NonZeroU8::MIN),
            parameters: RtpCodecParametersParameters::from([
                ("minptime", 10_u32.into()),
                ("useinbandfec", 1_u32.into()),
            ]),
            rtcp_feedback: vec![RtcpFeedback::TransportCc],
        },
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::Vp8,
            preferred_payload_type: Some(96),
            clock_rate: video_clock,
            parameters: RtpCodecParametersParameters::default(),
            rtcp_feedback: video_feedback(),
        },
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::Vp9,
            preferred_payload_type: Some(98),
            clock_rate: video_clock,
            parameters: RtpCodecParametersParameters::default(),
            rtcp_feedback: video_feedback(),
        },
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::H264,
            preferred_payload_type: Some(102),
            clock_rate: video_clock,
            parameters: RtpCodecParametersParameters::from([
                ("level-asymmetry-allowed", 1_u32.into()),
                ("packetization-mode", 1_u32.into()),
                ("profile-level-id", "42e01f".into()),
            ]),
            rtcp_feedback: video_feedback(),
        },
    ]
}
