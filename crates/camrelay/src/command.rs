//! Transcoder command construction
//!
//! Pure functions mapping {camera config, negotiated session, requested
//! stream parameters} to the transcoder argument list. Nothing here touches
//! the process table; the supervisor owns execution.

use crate::config::CameraConfig;
use crate::session::{PendingSession, StreamEndpoint};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// Requested video stream parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoParams {
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_video_payload_type")]
    pub payload_type: u8,
    /// Requested bitrate ceiling in kbit/s (0 = leave to the encoder)
    #[serde(default)]
    pub max_bitrate: u32,
    /// Transport MTU; used as packet size unless the camera pins one
    #[serde(default = "default_video_mtu")]
    pub mtu: u32,
}

/// Requested audio stream parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioParams {
    #[serde(default = "default_audio_payload_type")]
    pub payload_type: u8,
    /// Requested bitrate in kbit/s (0 = leave to the encoder)
    #[serde(default)]
    pub max_bitrate: u32,
    /// Sample rate in kHz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_audio_mtu")]
    pub mtu: u32,
}

fn default_fps() -> u32 {
    30
}

fn default_video_payload_type() -> u8 {
    99
}

fn default_video_mtu() -> u32 {
    1378
}

fn default_audio_payload_type() -> u8 {
    110
}

fn default_sample_rate() -> u32 {
    16
}

fn default_audio_mtu() -> u32 {
    188
}

/// How a snapshot request's dimensions are honored
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AspectMode {
    /// Fix the width, derive the height from the source aspect
    WidthLocked,
    /// Fix the height, derive the width from the source aspect
    HeightLocked,
    /// Force both dimensions
    #[default]
    Exact,
}

/// A still-capture request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub mode: AspectMode,
}

/// Clamp a requested value to a configured ceiling; 0 means unlimited
fn clamp(requested: u32, max: u32) -> u32 {
    if max > 0 {
        requested.min(max)
    } else {
        requested
    }
}

/// Apply the configured bitrate ceiling, then the floor
fn clamp_bitrate(cfg: &CameraConfig, requested: u32) -> u32 {
    clamp(requested, cfg.max_bitrate).max(cfg.min_bitrate)
}

/// Build the filter chain: flips first, then the scale or override filter.
///
/// Flip-then-scale ordering is load-bearing: scaling first would flip the
/// already-resized frame around the wrong axis on anamorphic sources.
fn filter_chain(cfg: &CameraConfig, scale: String) -> String {
    let mut filters = Vec::new();
    if cfg.flip_horizontal {
        filters.push("hflip".to_string());
    }
    if cfg.flip_vertical {
        filters.push("vflip".to_string());
    }
    match &cfg.video_filter {
        Some(custom) => filters.push(custom.clone()),
        None => filters.push(scale),
    }
    filters.join(",")
}

fn push_str_args(args: &mut Vec<String>, items: &[&str]) {
    args.extend(items.iter().map(|s| s.to_string()));
}

/// Build the argument list for a one-shot still capture.
///
/// Selects a single frame from the still source (or the stream source as
/// fallback) and writes one raw image to stdout.
pub fn snapshot_args(cfg: &CameraConfig, req: &SnapshotRequest) -> Vec<String> {
    let mut args: Vec<String> = cfg
        .still_input()
        .split_whitespace()
        .map(str::to_string)
        .collect();

    push_str_args(&mut args, &["-frames:v", "1"]);

    let width = clamp(req.width, cfg.max_width);
    let height = clamp(req.height, cfg.max_height);
    let scale = match req.mode {
        AspectMode::WidthLocked => format!("scale={}:-2", width),
        AspectMode::HeightLocked => format!("scale=-2:{}", height),
        AspectMode::Exact => format!("scale={}:{}", width, height),
    };
    args.push("-vf".to_string());
    args.push(filter_chain(cfg, scale));

    push_str_args(&mut args, &["-f", "image2", "-loglevel", "error", "-y", "-"]);
    args
}

/// Build the argument list for a live (S)RTP relay.
///
/// Video is always emitted; audio only when the camera enables it and the
/// request carries audio parameters. Requested dimensions, frame rate and
/// bitrate are clamped to the configured ceilings (and the bitrate raised to
/// the floor). The `copy` codec passes packets through, so every filter is
/// suppressed for it.
pub fn stream_args(
    cfg: &CameraConfig,
    session: &PendingSession,
    video: &VideoParams,
    audio: Option<&AudioParams>,
) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();

    if cfg.debug {
        push_str_args(&mut args, &["-loglevel", "level+verbose", "-stats"]);
    } else {
        // -stats keeps progress lines flowing on stderr; the supervisor
        // reads them as the readiness and liveness signal
        push_str_args(&mut args, &["-loglevel", "error", "-stats"]);
    }

    args.extend(cfg.source.split_whitespace().map(str::to_string));

    push_str_args(&mut args, &["-map", &cfg.map_video, "-vcodec", &cfg.vcodec]);

    let passthrough = cfg.vcodec == "copy";
    if !passthrough {
        let fps = clamp(video.fps, cfg.max_fps);
        if fps > 0 {
            push_str_args(&mut args, &["-r", &fps.to_string()]);
        }
        let width = clamp(video.width, cfg.max_width);
        let height = clamp(video.height, cfg.max_height);
        args.push("-vf".to_string());
        args.push(filter_chain(cfg, format!("scale={}:{}", width, height)));
        if let Some(options) = &cfg.encoder_options {
            args.extend(options.split_whitespace().map(str::to_string));
        }
    }

    let bitrate = clamp_bitrate(cfg, video.max_bitrate);
    if bitrate > 0 {
        push_str_args(
            &mut args,
            &[
                "-b:v",
                &format!("{}k", bitrate),
                "-maxrate",
                &format!("{}k", bitrate),
                "-bufsize",
                &format!("{}k", bitrate * 2),
            ],
        );
    }

    let video_pkt = cfg.packet_size.unwrap_or(video.mtu);
    push_rtp_output(
        &mut args,
        &session.video,
        session.controller_addr,
        video.payload_type,
        video_pkt,
    );

    if let Some(audio_params) = audio {
        push_str_args(
            &mut args,
            &[
                "-map",
                &cfg.map_audio,
                "-acodec",
                "libfdk_aac",
                "-profile:a",
                "aac_eld",
                "-flags",
                "+global_header",
                "-ar",
                &format!("{}k", audio_params.sample_rate),
            ],
        );
        if audio_params.max_bitrate > 0 {
            push_str_args(&mut args, &["-b:a", &format!("{}k", audio_params.max_bitrate)]);
        }
        let audio_pkt = cfg.packet_size.unwrap_or(audio_params.mtu);
        push_rtp_output(
            &mut args,
            &session.audio,
            session.controller_addr,
            audio_params.payload_type,
            audio_pkt,
        );
    }

    args
}

/// Emit one SRTP output leg carrying exactly the negotiated parameters
fn push_rtp_output(
    args: &mut Vec<String>,
    endpoint: &StreamEndpoint,
    controller: std::net::IpAddr,
    payload_type: u8,
    pkt_size: u32,
) {
    push_str_args(
        args,
        &[
            "-payload_type",
            &payload_type.to_string(),
            "-ssrc",
            &endpoint.ssrc.to_string(),
            "-f",
            "rtp",
            "-srtp_out_suite",
            &endpoint.crypto.suite,
            "-srtp_out_params",
            &BASE64.encode(&endpoint.crypto.key_salt),
        ],
    );
    args.push(format!(
        "srtp://{}:{}?rtcpport={}&localrtcpport={}&pkt_size={}",
        controller, endpoint.port, endpoint.port, endpoint.port, pkt_size
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::session::StreamCrypto;
    use std::net::{IpAddr, Ipv4Addr};

    fn camera(extra: &str) -> CameraConfig {
        let yaml = format!(
            r#"
cameras:
  - name: "cam"
    source: "-i rtsp://camera/stream"
{extra}"#
        );
        Config::parse(&yaml).unwrap().cameras[0]
            .clone()
            .validated()
            .unwrap()
    }

    fn session() -> PendingSession {
        PendingSession {
            controller_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)),
            video: StreamEndpoint {
                port: 51000,
                ssrc: 111,
                crypto: StreamCrypto {
                    suite: "AES_CM_128_HMAC_SHA1_80".to_string(),
                    key_salt: vec![1u8; 30],
                },
            },
            audio: StreamEndpoint {
                port: 51002,
                ssrc: 222,
                crypto: StreamCrypto {
                    suite: "AES_CM_128_HMAC_SHA1_80".to_string(),
                    key_salt: vec![2u8; 30],
                },
            },
        }
    }

    fn video() -> VideoParams {
        VideoParams {
            width: 1920,
            height: 1080,
            fps: 30,
            payload_type: 99,
            max_bitrate: 300,
            mtu: 1378,
        }
    }

    fn arg_after<'a>(args: &'a [String], flag: &str) -> &'a str {
        let idx = args.iter().position(|a| a == flag).unwrap();
        &args[idx + 1]
    }

    #[test]
    fn test_requested_width_clamped_to_max() {
        let cfg = camera("    max_width: 1280\n    max_height: 720");
        let args = stream_args(&cfg, &session(), &video(), None);
        assert_eq!(arg_after(&args, "-vf"), "scale=1280:720");
    }

    #[test]
    fn test_bitrate_clamped_to_ceiling() {
        let cfg = camera("    max_bitrate: 200");
        let args = stream_args(&cfg, &session(), &video(), None);
        assert_eq!(arg_after(&args, "-b:v"), "200k");
        assert_eq!(arg_after(&args, "-maxrate"), "200k");
        assert_eq!(arg_after(&args, "-bufsize"), "400k");
    }

    #[test]
    fn test_bitrate_raised_to_floor() {
        let cfg = camera("    min_bitrate: 500");
        let args = stream_args(&cfg, &session(), &video(), None);
        assert_eq!(arg_after(&args, "-b:v"), "500k");
    }

    #[test]
    fn test_flips_precede_scale_and_custom_filter() {
        let cfg = camera("    flip_horizontal: true\n    flip_vertical: true");
        let args = stream_args(&cfg, &session(), &video(), None);
        assert_eq!(arg_after(&args, "-vf"), "hflip,vflip,scale=1920:1080");

        let cfg = camera(
            "    flip_vertical: true\n    video_filter: \"crop=100:100:0:0\"",
        );
        let args = stream_args(&cfg, &session(), &video(), None);
        assert_eq!(arg_after(&args, "-vf"), "vflip,crop=100:100:0:0");
    }

    #[test]
    fn test_copy_codec_suppresses_filters() {
        let cfg = camera("    vcodec: \"copy\"\n    flip_horizontal: true\n    video_filter: \"crop=1:1:0:0\"");
        let args = stream_args(&cfg, &session(), &video(), None);
        assert!(!args.iter().any(|a| a == "-vf"));
        assert!(!args.iter().any(|a| a == "-r"));
        assert_eq!(arg_after(&args, "-vcodec"), "copy");
    }

    #[test]
    fn test_packet_size_prefers_config_over_mtu() {
        let cfg = camera("    packet_size: 564");
        let args = stream_args(&cfg, &session(), &video(), None);
        assert!(args.last().unwrap().ends_with("pkt_size=564"));

        let cfg = camera("");
        let args = stream_args(&cfg, &session(), &video(), None);
        assert!(args.last().unwrap().ends_with("pkt_size=1378"));
    }

    #[test]
    fn test_negotiated_parameters_reach_the_command_line() {
        let cfg = camera("");
        let args = stream_args(&cfg, &session(), &video(), None);
        assert_eq!(arg_after(&args, "-ssrc"), "111");
        assert_eq!(arg_after(&args, "-payload_type"), "99");
        assert_eq!(arg_after(&args, "-srtp_out_suite"), "AES_CM_128_HMAC_SHA1_80");
        assert_eq!(
            arg_after(&args, "-srtp_out_params"),
            BASE64.encode(vec![1u8; 30])
        );
        assert!(args
            .last()
            .unwrap()
            .starts_with("srtp://10.0.0.7:51000?rtcpport=51000&localrtcpport=51000"));
    }

    #[test]
    fn test_audio_leg_only_when_requested() {
        let cfg = camera("    audio: true");
        let no_audio = stream_args(&cfg, &session(), &video(), None);
        assert!(!no_audio.iter().any(|a| a == "-acodec"));

        let audio = AudioParams {
            payload_type: 110,
            max_bitrate: 24,
            sample_rate: 16,
            mtu: 188,
        };
        let with_audio = stream_args(&cfg, &session(), &video(), Some(&audio));
        assert_eq!(arg_after(&with_audio, "-acodec"), "libfdk_aac");
        assert_eq!(arg_after(&with_audio, "-ar"), "16k");
        assert_eq!(arg_after(&with_audio, "-b:a"), "24k");
        assert!(with_audio
            .last()
            .unwrap()
            .starts_with("srtp://10.0.0.7:51002"));
    }

    #[test]
    fn test_snapshot_aspect_modes() {
        let cfg = camera("    max_width: 1280\n    max_height: 720");
        let req = SnapshotRequest {
            width: 1920,
            height: 1080,
            mode: AspectMode::WidthLocked,
        };
        let args = snapshot_args(&cfg, &req);
        assert_eq!(arg_after(&args, "-vf"), "scale=1280:-2");

        let req = SnapshotRequest {
            width: 640,
            height: 360,
            mode: AspectMode::HeightLocked,
        };
        let args = snapshot_args(&cfg, &req);
        assert_eq!(arg_after(&args, "-vf"), "scale=-2:360");

        let req = SnapshotRequest {
            width: 640,
            height: 360,
            mode: AspectMode::Exact,
        };
        let args = snapshot_args(&cfg, &req);
        assert_eq!(arg_after(&args, "-vf"), "scale=640:360");
    }

    #[test]
    fn test_snapshot_selects_one_frame_to_stdout() {
        let cfg = camera("    still_source: \"-i http://camera/still\"");
        let req = SnapshotRequest {
            width: 640,
            height: 360,
            mode: AspectMode::Exact,
        };
        let args = snapshot_args(&cfg, &req);
        assert_eq!(args[0], "-i");
        assert_eq!(args[1], "http://camera/still");
        assert_eq!(arg_after(&args, "-frames:v"), "1");
        assert_eq!(arg_after(&args, "-f"), "image2");
        assert_eq!(args.last().unwrap(), "-");
    }

    #[test]
    fn test_snapshot_flips_before_scale() {
        let cfg = camera("    flip_horizontal: true");
        let req = SnapshotRequest {
            width: 640,
            height: 360,
            mode: AspectMode::Exact,
        };
        let args = snapshot_args(&cfg, &req);
        assert_eq!(arg_after(&args, "-vf"), "hflip,scale=640:360");
    }
}
