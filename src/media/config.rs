#![forbid(unsafe_code)]

// Configuration for mediasoup workers, routers, and transports

use crate::config::Config;
use mediasoup::prelude::*;
use mediasoup::worker::{WorkerLogLevel, WorkerLogTag};
use std::net::IpAddr;
use std::num::{NonZeroU32, NonZeroU8};
use std::ops::RangeInclusive;

const OPUS_CLOCK_RATE: u32 = 48_000;
const VIDEO_CLOCK_RATE: u32 = 90_000;
const VP8_START_BITRATE_KBPS: u32 = 1_000;

/// Main media engine configuration
#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub worker_config: WorkerConfig,
    pub router_config: RouterConfig,
    pub webrtc_transport_config: WebRtcTransportConfig,
}

impl MediaConfig {
    pub fn from_config(config: &Config) -> Self {
        let port_range = config.rtc_min_port..=config.rtc_max_port;
        Self {
            worker_config: WorkerConfig {
                num_workers: config.num_workers,
                ..WorkerConfig::default()
            },
            router_config: RouterConfig::default(),
            webrtc_transport_config: WebRtcTransportConfig {
                listen_ip: config.listen_ip,
                announced_ip: Some(config.announced_ip),
                port_range: Some(port_range),
                ..WebRtcTransportConfig::default()
            },
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            worker_config: WorkerConfig::default(),
            router_config: RouterConfig::default(),
            webrtc_transport_config: WebRtcTransportConfig::default(),
        }
    }
}

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub num_workers: usize,
    pub log_level: WorkerLogLevel,
    pub log_tags: Vec<WorkerLogTag>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            log_level: WorkerLogLevel::Warn,
            log_tags: vec![
                WorkerLogTag::Info,
                WorkerLogTag::Ice,
                WorkerLogTag::Dtls,
                WorkerLogTag::Rtp,
                WorkerLogTag::Rtcp,
            ],
        }
    }
}

impl WorkerConfig {
    /// Converts to mediasoup WorkerSettings
    pub fn to_worker_settings(&self) -> WorkerSettings {
        let mut settings = WorkerSettings::default();
        settings.log_level = self.log_level;
        settings.log_tags = self.log_tags.clone();
        settings
    }
}

/// Router configuration: the fixed codec set every room shares
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            media_codecs: Self::default_codecs(),
        }
    }
}

impl RouterConfig {
    /// Opus 48 kHz stereo and VP8
    pub fn default_codecs() -> Vec<RtpCodecCapability> {
        let mut codecs = Vec::with_capacity(2);

        if let (Some(clock_rate), Some(channels)) = (NonZeroU32::new(OPUS_CLOCK_RATE), NonZeroU8::new(2)) {
            codecs.push(RtpCodecCapability::Audio {
                mime_type: MimeTypeAudio::Opus,
                preferred_payload_type: None,
                clock_rate,
                channels,
                parameters: RtpCodecParametersParameters::default(),
                rtcp_feedback: vec![RtcpFeedback::TransportCc],
            });
        }

        if let Some(clock_rate) = NonZeroU32::new(VIDEO_CLOCK_RATE) {
            codecs.push(RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::Vp8,
                preferred_payload_type: None,
                clock_rate,
                parameters: RtpCodecParametersParameters::from([(
                    "x-google-start-bitrate",
                    VP8_START_BITRATE_KBPS.into(),
                )]),
                rtcp_feedback: vec![
                    RtcpFeedback::Nack,
                    RtcpFeedback::NackPli,
                    RtcpFeedback::CcmFir,
                    RtcpFeedback::GoogRemb,
                    RtcpFeedback::TransportCc,
                ],
            });
        }

        codecs
    }

    pub fn to_router_options(&self) -> RouterOptions {
        RouterOptions::new(self.media_codecs.clone())
    }
}

/// WebRTC transport configuration
#[derive(Debug, Clone)]
pub struct WebRtcTransportConfig {
    pub listen_ip: IpAddr,
    pub announced_ip: Option<IpAddr>,
    pub port_range: Option<RangeInclusive<u16>>,
    pub initial_available_outgoing_bitrate: u32,
}

impl Default for WebRtcTransportConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::from([127, 0, 0, 1]),
            announced_ip: None,
            port_range: None,
            initial_available_outgoing_bitrate: 900_000,
        }
    }
}

impl WebRtcTransportConfig {
    pub fn to_transport_options(&self) -> WebRtcTransportOptions {
        let listen_info = ListenInfo {
            protocol: Protocol::Udp,
            ip: self.listen_ip,
            announced_address: self.announced_ip.map(|ip| ip.to_string()),
            port: None,
            port_range: self.port_range.clone(),
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
            expose_internal_ip: false,
        };
        let mut options = WebRtcTransportOptions::new(WebRtcTransportListenInfos::new(listen_info));
        options.initial_available_outgoing_bitrate = self.initial_available_outgoing_bitrate;
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_codec_set_is_opus_and_vp8() {
        let codecs = RouterConfig::default_codecs();
        assert_eq!(codecs.len(), 2);
        assert!(matches!(
            codecs[0],
            RtpCodecCapability::Audio { mime_type: MimeTypeAudio::Opus, .. }
        ));
        assert!(matches!(
            codecs[1],
            RtpCodecCapability::Video { mime_type: MimeTypeVideo::Vp8, .. }
        ));
    }

    #[test]
    fn test_from_config_carries_network_settings() {
        let vars = HashMap::from([
            ("JWT_SECRET".to_string(), "secret".to_string()),
            ("MEDIASOUP_NUM_WORKERS".to_string(), "3".to_string()),
            ("MEDIASOUP_ANNOUNCED_IP".to_string(), "198.51.100.4".to_string()),
        ]);
        let config = Config::from_vars(&vars).unwrap();
        let media = MediaConfig::from_config(&config);

        assert_eq!(media.worker_config.num_workers, 3);
        assert_eq!(
            media.webrtc_transport_config.announced_ip,
            Some("198.51.100.4".parse().unwrap())
        );
        assert_eq!(media.webrtc_transport_config.port_range, Some(40_000..=49_999));
        assert_eq!(media.webrtc_transport_config.initial_available_outgoing_bitrate, 900_000);
    }
}
